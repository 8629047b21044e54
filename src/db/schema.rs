//! Database schema initialization

use sqlx::SqlitePool;

/// Initialize the database schema
pub async fn initialize_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(SCHEMA_SQL).execute(pool).await?;

    Ok(())
}

const SCHEMA_SQL: &str = r#"
-- Users (credential lookup and activation)
CREATE TABLE IF NOT EXISTS users (
    id BLOB PRIMARY KEY,
    user_name TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    activation_code TEXT,
    active INTEGER NOT NULL DEFAULT 1,
    activated INTEGER NOT NULL DEFAULT 0,
    last_login TEXT,
    created_at TEXT NOT NULL
);

-- Browser sessions, keyed by a hash of the cookie secret
CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_hash TEXT NOT NULL UNIQUE,
    user_id BLOB,
    ip_address TEXT,
    created_at TEXT NOT NULL,
    last_accessed TEXT NOT NULL,
    expired INTEGER NOT NULL DEFAULT 0
);

-- Access tokens, stored as SHA-256 digests
CREATE TABLE IF NOT EXISTS access_tokens (
    token_hash TEXT PRIMARY KEY,
    user_id BLOB NOT NULL,
    issued_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_access_tokens_user ON access_tokens(user_id);

-- At most one live refresh token per user
CREATE TABLE IF NOT EXISTS refresh_tokens (
    user_id BLOB PRIMARY KEY,
    token_hash TEXT NOT NULL,
    issued_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

-- Upload ledger
CREATE TABLE IF NOT EXISTS uploads (
    id BLOB PRIMARY KEY,
    user_id BLOB NOT NULL,
    machine_id INTEGER,
    path TEXT NOT NULL,
    backend TEXT NOT NULL,
    declared_size INTEGER NOT NULL,
    part_count INTEGER,
    received_bytes INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'initialized',
    backend_handle TEXT,
    location TEXT,
    failure_reason TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_uploads_user ON uploads(user_id);
CREATE INDEX IF NOT EXISTS idx_uploads_status ON uploads(status);

CREATE TABLE IF NOT EXISTS upload_parts (
    upload_id BLOB NOT NULL,
    part_id INTEGER NOT NULL,
    size INTEGER NOT NULL,
    checksum TEXT NOT NULL,
    etag TEXT,
    recorded_at TEXT NOT NULL,

    PRIMARY KEY (upload_id, part_id)
);

-- Backup agents, upserted by heartbeat
CREATE TABLE IF NOT EXISTS machines (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    host_name TEXT NOT NULL UNIQUE,
    os TEXT NOT NULL,
    dns_name TEXT NOT NULL,
    ip_address TEXT,
    domain TEXT NOT NULL,
    client_version TEXT NOT NULL,
    last_check_in TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_machines (
    machine_id INTEGER NOT NULL,
    user_id BLOB NOT NULL,
    last_check_in TEXT NOT NULL,

    PRIMARY KEY (machine_id, user_id)
);

-- Client settings with per-user overrides
CREATE TABLE IF NOT EXISTS client_settings (
    setting_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    value TEXT NOT NULL,
    data_type TEXT NOT NULL DEFAULT 'string'
);

CREATE TABLE IF NOT EXISTS user_settings (
    setting_id INTEGER NOT NULL,
    user_id BLOB NOT NULL,
    value TEXT NOT NULL,

    PRIMARY KEY (setting_id, user_id)
);

-- Authentication and error events
CREATE TABLE IF NOT EXISTS event_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id BLOB,
    category TEXT NOT NULL,
    severity TEXT NOT NULL,
    message TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;
