//! Application state management

use std::sync::Arc;

use chrono::Duration;
use sqlx::SqlitePool;

use crate::auth::{SessionGuard, SessionStore, TokenConfig, TokenStore, UserDirectory};
use crate::config::Config;
use crate::event_log::EventLog;
use crate::heartbeat::HeartbeatRegistrar;
use crate::janitor::Janitor;
use crate::settings::SettingsStore;
use crate::storage::StorageRegistry;
use crate::upload::{EngineConfig, UploadEngine, UploadLedger};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    db: SqlitePool,
    guard: SessionGuard,
    users: UserDirectory,
    engine: UploadEngine,
    heartbeat: HeartbeatRegistrar,
    settings: SettingsStore,
    event_log: EventLog,
}

impl AppState {
    /// Wire every component onto one pool and one set of storage adapters
    pub fn new(config: Config, db: SqlitePool, storage: StorageRegistry) -> Self {
        let tokens = TokenStore::new(db.clone(), TokenConfig::from_auth_config(&config.auth));
        let guard = SessionGuard::new(
            tokens,
            SessionStore::new(db.clone()),
            Duration::seconds(config.auth.session_ttl_secs),
        );

        let heartbeat = HeartbeatRegistrar::new(db.clone());
        let event_log = EventLog::new(db.clone());
        let engine = UploadEngine::new(
            UploadLedger::new(db.clone()),
            storage,
            heartbeat.clone(),
            event_log.clone(),
            EngineConfig::from_upload_config(&config.uploads),
        );

        Self {
            inner: Arc::new(AppStateInner {
                users: UserDirectory::new(db.clone()),
                settings: SettingsStore::new(db.clone()),
                config,
                db,
                guard,
                engine,
                heartbeat,
                event_log,
            }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the database pool
    pub fn db(&self) -> &SqlitePool {
        &self.inner.db
    }

    pub fn guard(&self) -> &SessionGuard {
        &self.inner.guard
    }

    pub fn tokens(&self) -> &TokenStore {
        self.inner.guard.tokens()
    }

    pub fn users(&self) -> &UserDirectory {
        &self.inner.users
    }

    pub fn engine(&self) -> &UploadEngine {
        &self.inner.engine
    }

    pub fn heartbeat(&self) -> &HeartbeatRegistrar {
        &self.inner.heartbeat
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.inner.settings
    }

    pub fn event_log(&self) -> &EventLog {
        &self.inner.event_log
    }

    /// Maintenance over this state's uploads, tokens and sessions
    pub fn janitor(&self) -> Janitor {
        Janitor::new(
            self.inner.engine.clone(),
            self.inner.guard.clone(),
            self.inner.event_log.clone(),
        )
    }
}
