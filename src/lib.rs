//! Vessel Server
//!
//! Ingestion service for backup agents: token and browser-session
//! authentication, machine heartbeats, per-user client settings and
//! resumable multipart uploads onto local disk, S3 or Azure Blob storage.

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod event_log;
pub mod heartbeat;
pub mod janitor;
pub mod locks;
pub mod routes;
pub mod settings;
pub mod state;
pub mod storage;
pub mod upload;

pub use config::Config;
pub use error::{AppError, Result};
pub use state::AppState;
