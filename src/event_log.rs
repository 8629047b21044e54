//! Event log
//!
//! Persists `(message, category, severity)` events for authentication and
//! error reporting. Recording never fails from the caller's point of view:
//! if the insert fails the event is still emitted through `tracing`.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::ErrorRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    Authentication,
    Api,
    Upload,
    Heartbeat,
    Janitor,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Authentication => "Authentication",
            Category::Api => "API",
            Category::Upload => "Upload",
            Category::Heartbeat => "Heartbeat",
            Category::Janitor => "Janitor",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

/// A stored event
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventEntry {
    pub user_id: Option<Uuid>,
    pub category: String,
    pub severity: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct EventLog {
    db: SqlitePool,
}

impl EventLog {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn record(
        &self,
        user_id: Option<Uuid>,
        message: &str,
        category: Category,
        severity: Severity,
    ) {
        match severity {
            Severity::Info => {
                tracing::info!(category = category.as_str(), user_id = ?user_id, "{}", message)
            }
            Severity::Warning => {
                tracing::warn!(category = category.as_str(), user_id = ?user_id, "{}", message)
            }
            Severity::Error => {
                tracing::error!(category = category.as_str(), user_id = ?user_id, "{}", message)
            }
        }

        let result = sqlx::query(
            r#"
            INSERT INTO event_log (user_id, category, severity, message, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(category.as_str())
        .bind(severity.as_str())
        .bind(message)
        .bind(Utc::now())
        .execute(&self.db)
        .await;

        if let Err(e) = result {
            tracing::warn!(error = %e, "Failed to persist event log entry");
        }
    }

    pub async fn info(&self, user_id: Option<Uuid>, message: &str, category: Category) {
        self.record(user_id, message, category, Severity::Info).await
    }

    pub async fn error(&self, user_id: Option<Uuid>, message: &str, category: Category) {
        self.record(user_id, message, category, Severity::Error).await
    }

    /// Most recent events first
    pub async fn recent(&self, limit: i64) -> Result<Vec<EventEntry>, sqlx::Error> {
        sqlx::query_as::<_, EventEntry>(
            r#"
            SELECT user_id, category, severity, message, created_at
            FROM event_log
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.db)
        .await
    }
}

/// Middleware recording every error response produced by a handler
pub async fn record_errors(State(log): State<EventLog>, request: Request, next: Next) -> Response {
    let response = next.run(request).await;

    if let Some(record) = response.extensions().get::<ErrorRecord>().cloned() {
        log.record(None, &record.message, record.category, record.severity)
            .await;
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[tokio::test]
    async fn test_record_and_read_back() {
        let pool = db::create_pool("sqlite::memory:").await.unwrap();
        let log = EventLog::new(pool);

        log.error(None, "Authentication failed (Username=bob)", Category::Authentication)
            .await;
        log.info(None, "Upload completed", Category::Upload).await;

        let entries = log.recent(10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].category, "Upload");
        assert_eq!(entries[1].severity, "error");
    }

    #[tokio::test]
    async fn test_record_survives_missing_table() {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        let log = EventLog::new(pool);

        // No schema: the insert fails but recording must not panic or error
        log.error(None, "original failure", Category::Api).await;
    }
}
