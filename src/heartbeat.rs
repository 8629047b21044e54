//! Heartbeat Registrar
//!
//! Agents check in periodically; each heartbeat upserts the machine record
//! by host name and links it to the authenticated user.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::AppError;

#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<HeartbeatError> for AppError {
    fn from(err: HeartbeatError) -> Self {
        match err {
            HeartbeatError::MissingField(_) => AppError::InvalidInput(err.to_string()),
            HeartbeatError::Database(e) => AppError::Database(e),
        }
    }
}

/// Body of `POST /heartbeat`. Fields are optional on the wire so a missing
/// one is reported by name.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub host_name: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub client_version: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
}

/// A validated heartbeat
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineReport {
    pub host_name: String,
    pub os: String,
    pub client_version: String,
    pub domain: String,
}

impl HeartbeatRequest {
    pub fn validate(self) -> Result<MachineReport, HeartbeatError> {
        fn required(value: Option<String>, name: &'static str) -> Result<String, HeartbeatError> {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or(HeartbeatError::MissingField(name))
        }

        Ok(MachineReport {
            host_name: required(self.host_name, "host_name")?,
            os: required(self.os, "os")?,
            client_version: required(self.client_version, "client_version")?,
            domain: required(self.domain, "domain")?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatResponse {
    pub machine_id: i64,
    /// Unix timestamp, seconds
    pub last_check_in: i64,
    /// The machine was linked to this user by this beat
    #[serde(skip)]
    pub first_check_in: bool,
}

#[derive(Clone)]
pub struct HeartbeatRegistrar {
    db: SqlitePool,
}

impl HeartbeatRegistrar {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Upsert the machine and its link to `user_id`
    pub async fn beat(
        &self,
        user_id: Uuid,
        report: &MachineReport,
        ip_address: Option<&str>,
    ) -> Result<HeartbeatResponse, HeartbeatError> {
        self.beat_at(user_id, report, ip_address, Utc::now()).await
    }

    pub async fn beat_at(
        &self,
        user_id: Uuid,
        report: &MachineReport,
        ip_address: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatResponse, HeartbeatError> {
        let mut tx = self.db.begin().await?;

        let (machine_id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO machines (host_name, os, dns_name, ip_address, domain, client_version, last_check_in)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(host_name) DO UPDATE SET
                os = excluded.os,
                dns_name = excluded.dns_name,
                ip_address = COALESCE(excluded.ip_address, machines.ip_address),
                domain = excluded.domain,
                client_version = excluded.client_version,
                last_check_in = excluded.last_check_in
            RETURNING id
            "#,
        )
        .bind(&report.host_name)
        .bind(&report.os)
        .bind(&report.host_name)
        .bind(ip_address)
        .bind(&report.domain)
        .bind(&report.client_version)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        let (linked,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM user_machines WHERE machine_id = ? AND user_id = ?",
        )
        .bind(machine_id)
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO user_machines (machine_id, user_id, last_check_in)
            VALUES (?, ?, ?)
            ON CONFLICT(machine_id, user_id) DO UPDATE SET
                last_check_in = excluded.last_check_in
            "#,
        )
        .bind(machine_id)
        .bind(user_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(
            machine_id = machine_id,
            host_name = %report.host_name,
            user_id = %user_id,
            "Heartbeat recorded"
        );

        Ok(HeartbeatResponse {
            machine_id,
            last_check_in: now.timestamp(),
            first_check_in: linked == 0,
        })
    }

    pub async fn machine_id_for_host(&self, host_name: &str) -> Result<Option<i64>, HeartbeatError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM machines WHERE host_name = ?")
            .bind(host_name)
            .fetch_optional(&self.db)
            .await?;

        Ok(row.map(|(id,)| id))
    }

    /// Machines linked to a user, most recent check-in first
    pub async fn machines_for_user(&self, user_id: Uuid) -> Result<Vec<i64>, HeartbeatError> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT machine_id FROM user_machines
            WHERE user_id = ?
            ORDER BY last_check_in DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn report(host: &str, version: &str) -> MachineReport {
        MachineReport {
            host_name: host.into(),
            os: "linux".into(),
            client_version: version.into(),
            domain: "corp".into(),
        }
    }

    #[test]
    fn test_validate_reports_missing_field() {
        let request = HeartbeatRequest {
            host_name: Some("host-1".into()),
            os: Some("linux".into()),
            client_version: Some("  ".into()),
            domain: Some("corp".into()),
        };
        assert!(matches!(
            request.validate(),
            Err(HeartbeatError::MissingField("client_version"))
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_upserts_by_host() {
        let pool = db::create_pool("sqlite::memory:").await.unwrap();
        let registrar = HeartbeatRegistrar::new(pool);
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let first = registrar
            .beat(alice, &report("host-1", "1.0"), Some("10.0.0.1"))
            .await
            .unwrap();
        let second = registrar
            .beat(bob, &report("host-1", "1.1"), None)
            .await
            .unwrap();
        let other = registrar
            .beat(alice, &report("host-2", "1.0"), None)
            .await
            .unwrap();

        assert_eq!(first.machine_id, second.machine_id);
        assert_ne!(first.machine_id, other.machine_id);
        assert!(first.first_check_in && second.first_check_in);

        let again = registrar
            .beat(alice, &report("host-1", "1.2"), None)
            .await
            .unwrap();
        assert!(!again.first_check_in);
        assert_eq!(
            registrar.machine_id_for_host("host-1").await.unwrap(),
            Some(first.machine_id)
        );
        assert_eq!(registrar.machine_id_for_host("nope").await.unwrap(), None);
        assert_eq!(registrar.machines_for_user(bob).await.unwrap(), vec![first.machine_id]);
        assert_eq!(registrar.machines_for_user(alice).await.unwrap().len(), 2);
    }
}
