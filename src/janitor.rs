//! Background maintenance
//!
//! One pass every `JANITOR_INTERVAL_SECS`:
//! - abort open uploads idle past their TTL
//! - delete expired access tokens
//! - delete browser sessions that can no longer authenticate

use chrono::{DateTime, Utc};

use crate::auth::SessionGuard;
use crate::event_log::{Category, EventLog, Severity};
use crate::upload::UploadEngine;

/// What one pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JanitorReport {
    pub swept_uploads: usize,
    pub pruned_tokens: u64,
    pub pruned_sessions: u64,
}

#[derive(Clone)]
pub struct Janitor {
    engine: UploadEngine,
    guard: SessionGuard,
    event_log: EventLog,
}

impl Janitor {
    pub fn new(engine: UploadEngine, guard: SessionGuard, event_log: EventLog) -> Self {
        Self {
            engine,
            guard,
            event_log,
        }
    }

    /// Run every step; a failing step is logged and the rest still run
    pub async fn run_once(&self) -> JanitorReport {
        self.run_at(Utc::now()).await
    }

    pub async fn run_at(&self, now: DateTime<Utc>) -> JanitorReport {
        let mut report = JanitorReport::default();

        match self.engine.sweep_stale().await {
            Ok(count) => report.swept_uploads = count,
            Err(e) => self.failed("Stale upload sweep", &e).await,
        }

        match self.guard.tokens().prune_expired(now).await {
            Ok(count) => report.pruned_tokens = count,
            Err(e) => self.failed("Access token prune", &e).await,
        }

        match self.guard.sessions().prune(now, self.guard.session_ttl()).await {
            Ok(count) => report.pruned_sessions = count,
            Err(e) => self.failed("Session prune", &e).await,
        }

        if report != JanitorReport::default() {
            self.event_log
                .info(
                    None,
                    &format!(
                        "Janitor pass (Uploads={}, Tokens={}, Sessions={})",
                        report.swept_uploads, report.pruned_tokens, report.pruned_sessions
                    ),
                    Category::Janitor,
                )
                .await;
        }

        report
    }

    async fn failed(&self, step: &str, error: &(dyn std::fmt::Display + Sync)) {
        self.event_log
            .record(
                None,
                &format!("{} failed: {}", step, error),
                Category::Janitor,
                Severity::Warning,
            )
            .await;
    }

    /// Start background janitor task
    pub fn start(self, interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                ticker.tick().await;
                let report = self.run_once().await;
                tracing::debug!(?report, "Janitor pass finished");
            }
        })
    }
}
