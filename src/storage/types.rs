//! Storage types

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Backend selected for an upload at init time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    S3,
    Azure,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::S3 => "s3",
            BackendKind::Azure => "azure",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(BackendKind::Local),
            "s3" => Ok(BackendKind::S3),
            "azure" => Ok(BackendKind::Azure),
            other => Err(StorageError::UnknownBackend(other.to_string())),
        }
    }
}

/// Backend-side resource allocated by `prepare`, persisted with the ledger
/// entry so later requests can address it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendHandle {
    pub upload_id: Uuid,
    pub kind: BackendKind,
    /// Normalized object path / key
    pub key: String,
    /// Backend allocation id (the S3 multipart upload id)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
}

/// What a backend staged for one part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartReceipt {
    pub part_id: u32,
    pub size: u64,
    /// SHA-256 hex digest
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

/// A part as reported by the backend itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePart {
    pub part_id: u32,
    pub size: u64,
    pub etag: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Ledger and backend disagree about which bytes were staged
    #[error("Backend diverged from ledger: {0}")]
    Divergence(String),

    #[error("Part {part_id} is {size} bytes, below the backend minimum of {min}")]
    PartTooSmall { part_id: u32, size: u64, min: u64 },

    #[error("Upload {0} has no staged state on this backend")]
    NotPrepared(Uuid),

    #[error("Backend not available: {0}")]
    Unavailable(BackendKind),

    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    #[error("Invalid object path: {0}")]
    InvalidPath(String),

    #[error("Remote storage error: {0}")]
    Remote(String),
}

impl StorageError {
    /// Errors meaning the staged parts can never be committed as-is;
    /// anything else may succeed on retry
    pub fn is_verification_failure(&self) -> bool {
        matches!(
            self,
            StorageError::Divergence(_) | StorageError::PartTooSmall { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("local".parse::<BackendKind>().unwrap(), BackendKind::Local);
        assert_eq!(" S3 ".parse::<BackendKind>().unwrap(), BackendKind::S3);
        assert_eq!("Azure".parse::<BackendKind>().unwrap(), BackendKind::Azure);
        assert!("ftp".parse::<BackendKind>().is_err());

        let json = serde_json::to_string(&BackendKind::Azure).unwrap();
        assert_eq!(json, "\"azure\"");
    }

    #[test]
    fn test_handle_survives_ledger_storage() {
        let handle = BackendHandle {
            upload_id: Uuid::new_v4(),
            kind: BackendKind::S3,
            key: "uploads/backup/db.tar".into(),
            remote_id: Some("mpu-123".into()),
        };
        let stored = serde_json::to_string(&handle).unwrap();
        let back: BackendHandle = serde_json::from_str(&stored).unwrap();
        assert_eq!(back, handle);
    }
}
