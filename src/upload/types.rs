//! Upload types

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::Unauthenticated;
use crate::storage::{BackendHandle, BackendKind, StorageError};

use super::ledger::LedgerError;

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Initialized,
    InProgress,
    Completed,
    Failed,
    Aborted,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Initialized => "initialized",
            UploadStatus::InProgress => "in_progress",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
            UploadStatus::Aborted => "aborted",
        }
    }

    /// No transition leaves a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadStatus::Completed | UploadStatus::Failed | UploadStatus::Aborted
        )
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initialized" => Ok(UploadStatus::Initialized),
            "in_progress" => Ok(UploadStatus::InProgress),
            "completed" => Ok(UploadStatus::Completed),
            "failed" => Ok(UploadStatus::Failed),
            "aborted" => Ok(UploadStatus::Aborted),
            other => Err(format!("unknown upload status: {}", other)),
        }
    }
}

// ============================================================================
// Ledger Entry
// ============================================================================

/// One logical file transfer
#[derive(Debug, Clone, Serialize)]
pub struct UploadSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub machine_id: Option<i64>,
    pub path: String,
    pub backend: BackendKind,
    pub declared_size: u64,
    /// Declared part count, when the client announced one
    pub part_count: Option<u32>,
    pub received_bytes: u64,
    pub status: UploadStatus,
    #[serde(skip)]
    pub backend_handle: Option<BackendHandle>,
    pub location: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn accepts_parts(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn remaining_bytes(&self) -> u64 {
        self.declared_size.saturating_sub(self.received_bytes)
    }
}

/// Fields the ledger needs to open an entry
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub user_id: Uuid,
    pub machine_id: Option<i64>,
    pub path: String,
    pub backend: BackendKind,
    pub declared_size: u64,
    pub part_count: Option<u32>,
}

// ============================================================================
// Wire Types
// ============================================================================

/// Body of `POST /upload`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitRequest {
    pub path: String,
    pub size: u64,
    #[serde(default)]
    pub backend: Option<String>,
    /// Number of parts the client will send
    #[serde(default)]
    pub parts: Option<u32>,
    /// Agent host name, used to attribute the upload to a machine
    #[serde(default)]
    pub host_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitResponse {
    pub upload_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartResponse {
    pub part_id: u32,
    pub size: u64,
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteResponse {
    pub location: String,
}

/// Body of `GET /upload/{id}`
#[derive(Debug, Clone, Serialize)]
pub struct UploadStatusResponse {
    pub upload_id: Uuid,
    pub path: String,
    pub backend: BackendKind,
    pub status: UploadStatus,
    pub declared_size: u64,
    pub received_bytes: u64,
    pub part_count: Option<u32>,
    pub received_parts: Vec<u32>,
    pub location: Option<String>,
    pub failure_reason: Option<String>,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("not authenticated")]
    Unauthorized {
        token_expired: bool,
        authenticated: bool,
    },

    #[error("Invalid upload metadata: {0}")]
    InvalidMetadata(String),

    #[error("Upload not found: {0}")]
    NotFound(Uuid),

    #[error("{0}")]
    Conflict(String),

    #[error("Upload is missing parts {missing_parts:?}")]
    IncompleteUpload { missing_parts: Vec<u32> },

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl From<Unauthenticated> for UploadError {
    fn from(err: Unauthenticated) -> Self {
        UploadError::Unauthorized {
            token_expired: err.token_expired,
            authenticated: err.authenticated,
        }
    }
}

impl From<StorageError> for UploadError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Unavailable(_)
            | StorageError::UnknownBackend(_)
            | StorageError::InvalidPath(_) => UploadError::InvalidMetadata(err.to_string()),
            other => UploadError::Backend(other.to_string()),
        }
    }
}

impl From<LedgerError> for UploadError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(id) => UploadError::NotFound(id),
            LedgerError::DuplicatePart { part_id, .. } => {
                UploadError::Conflict(format!("Part {} was already received with different content", part_id))
            }
            LedgerError::UploadClosed(status) => {
                UploadError::Conflict(format!("Upload is already {}", status))
            }
            LedgerError::SizeExceeded { declared, attempted } => UploadError::InvalidMetadata(
                format!("Parts total {} bytes, more than the declared {}", attempted, declared),
            ),
            LedgerError::SizeMismatch { declared, received } => UploadError::Conflict(format!(
                "Received {} bytes but {} were declared",
                received, declared
            )),
            LedgerError::IncompleteUpload(missing_parts) => {
                UploadError::IncompleteUpload { missing_parts }
            }
            LedgerError::Database(e) => UploadError::Backend(e.to_string()),
            LedgerError::Corrupt(msg) => UploadError::Backend(msg),
        }
    }
}
