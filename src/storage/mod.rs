//! Storage backends for upload parts
//!
//! Every backend implements [`StorageAdapter`]: prepare a destination, stage
//! parts, then commit them into one object (rename on local disk,
//! multipart-complete on S3, block-list commit on Azure). Adapters keep no
//! ledger state of their own, only bytes.

mod azure;
mod local;
mod s3;
mod s3_client;
mod types;

pub use azure::AzureBlobStorage;
pub use local::LocalStorage;
pub use s3::S3Storage;
pub use s3_client::S3Client;
pub use types::*;

use std::collections::HashMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::StorageConfig;

// ============================================================================
// Adapter Trait
// ============================================================================

/// Capability contract shared by all backends
#[async_trait::async_trait]
pub trait StorageAdapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Smallest size accepted for every part except the last one
    fn min_part_size(&self) -> u64;

    /// Allocate the backend-side resource for an upload. Calling it again
    /// for the same upload id returns the existing handle.
    async fn prepare(
        &self,
        upload_id: Uuid,
        object_path: &str,
    ) -> Result<BackendHandle, StorageError>;

    /// Durably stage one whole part, or nothing at all
    async fn write_part(
        &self,
        handle: &BackendHandle,
        part_id: u32,
        data: &[u8],
    ) -> Result<PartReceipt, StorageError>;

    /// Verify `parts` against what the backend holds and assemble the
    /// final object. `parts` must be sorted by part id.
    async fn commit(
        &self,
        handle: &BackendHandle,
        parts: &[PartReceipt],
    ) -> Result<String, StorageError>;

    /// Best-effort cleanup; failures are logged, never returned
    async fn abort(&self, handle: &BackendHandle);
}

// ============================================================================
// Registry
// ============================================================================

/// Configured adapters, selected by [`BackendKind`]
#[derive(Clone, Default)]
pub struct StorageRegistry {
    adapters: HashMap<BackendKind, Arc<dyn StorageAdapter>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn StorageAdapter>) -> Self {
        self.adapters.insert(adapter.kind(), adapter);
        self
    }

    /// Local storage is always available; cloud backends only when their
    /// credentials are configured
    pub async fn from_config(config: &StorageConfig) -> Result<Self, StorageError> {
        let mut registry =
            Self::new().with_adapter(Arc::new(LocalStorage::new(config.local.root.clone())));

        if let Some(s3) = &config.s3 {
            let client = S3Client::new(s3).await?;
            registry = registry.with_adapter(Arc::new(S3Storage::new(client, s3.prefix.clone())));
            tracing::info!(bucket = %s3.bucket, "S3 storage enabled");
        }

        if let Some(azure) = &config.azure {
            registry = registry.with_adapter(Arc::new(AzureBlobStorage::new(azure)));
            tracing::info!(container = %azure.container_url, "Azure Blob storage enabled");
        }

        Ok(registry)
    }

    pub fn get(&self, kind: BackendKind) -> Result<Arc<dyn StorageAdapter>, StorageError> {
        self.adapters
            .get(&kind)
            .cloned()
            .ok_or(StorageError::Unavailable(kind))
    }

    pub fn kinds(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<_> = self.adapters.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// SHA-256 hex digest of a part
pub fn compute_checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Normalize a client-supplied object path into `a/b/c` form. Absolute
/// paths and `..` segments are rejected so objects stay under the
/// backend root.
pub fn normalize_object_path(path: &str) -> Result<String, StorageError> {
    if path.starts_with('/') || path.starts_with('\\') || path.contains('\0') {
        return Err(StorageError::InvalidPath(path.to_string()));
    }

    let mut segments = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => return Err(StorageError::InvalidPath(path.to_string())),
            s if s.contains(':') => return Err(StorageError::InvalidPath(path.to_string())),
            s => segments.push(s),
        }
    }

    if segments.is_empty() {
        return Err(StorageError::InvalidPath(path.to_string()));
    }

    Ok(segments.join("/"))
}

/// Check the parts a backend reports against the receipts the ledger holds.
/// Every expected part must be present with the same size (and ETag when
/// both sides have one); all but the last must meet `min_part_size`.
pub fn verify_remote_parts(
    expected: &[PartReceipt],
    actual: &[RemotePart],
    min_part_size: u64,
) -> Result<(), StorageError> {
    let remote: HashMap<u32, &RemotePart> = actual.iter().map(|p| (p.part_id, p)).collect();

    for (i, part) in expected.iter().enumerate() {
        let found = remote.get(&part.part_id).ok_or_else(|| {
            StorageError::Divergence(format!("part {} missing from backend", part.part_id))
        })?;

        if found.size != part.size {
            return Err(StorageError::Divergence(format!(
                "part {} is {} bytes on the backend, ledger says {}",
                part.part_id, found.size, part.size
            )));
        }

        if let (Some(a), Some(b)) = (&found.etag, &part.etag) {
            if a.trim_matches('"') != b.trim_matches('"') {
                return Err(StorageError::Divergence(format!(
                    "part {} ETag mismatch",
                    part.part_id
                )));
            }
        }

        let is_last = i + 1 == expected.len();
        if !is_last && part.size < min_part_size {
            return Err(StorageError::PartTooSmall {
                part_id: part.part_id,
                size: part.size,
                min: min_part_size,
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receipt(part_id: u32, size: u64, etag: Option<&str>) -> PartReceipt {
        PartReceipt {
            part_id,
            size,
            checksum: String::new(),
            etag: etag.map(String::from),
        }
    }

    fn remote(part_id: u32, size: u64, etag: Option<&str>) -> RemotePart {
        RemotePart {
            part_id,
            size,
            etag: etag.map(String::from),
        }
    }

    #[test]
    fn test_normalize_object_path() {
        assert_eq!(normalize_object_path("backup/db.tar").unwrap(), "backup/db.tar");
        assert_eq!(normalize_object_path("a//b/./c").unwrap(), "a/b/c");
        assert!(normalize_object_path("../etc/passwd").is_err());
        assert!(normalize_object_path("a/../../b").is_err());
        assert!(normalize_object_path("/etc/passwd").is_err());
        assert!(normalize_object_path("C:\\Windows").is_err());
        assert!(normalize_object_path("").is_err());
        assert!(normalize_object_path("./").is_err());
    }

    #[test]
    fn test_compute_checksum() {
        assert_eq!(
            compute_checksum(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_verify_remote_parts_accepts_match() {
        let expected = vec![receipt(1, 10, Some("\"a\"")), receipt(2, 3, Some("b"))];
        let actual = vec![remote(2, 3, Some("\"b\"")), remote(1, 10, Some("a"))];
        assert!(verify_remote_parts(&expected, &actual, 5).is_ok());
    }

    #[test]
    fn test_verify_remote_parts_detects_divergence() {
        let expected = vec![receipt(1, 10, None), receipt(2, 3, None)];

        let missing = vec![remote(1, 10, None)];
        assert!(matches!(
            verify_remote_parts(&expected, &missing, 1),
            Err(StorageError::Divergence(_))
        ));

        let truncated = vec![remote(1, 9, None), remote(2, 3, None)];
        assert!(matches!(
            verify_remote_parts(&expected, &truncated, 1),
            Err(StorageError::Divergence(_))
        ));

        let etags = vec![receipt(1, 10, Some("x"))];
        assert!(verify_remote_parts(&etags, &[remote(1, 10, Some("y"))], 1).is_err());
    }

    #[test]
    fn test_verify_remote_parts_enforces_minimum() {
        let expected = vec![receipt(1, 4, None), receipt(2, 2, None)];
        let actual = vec![remote(1, 4, None), remote(2, 2, None)];
        assert!(matches!(
            verify_remote_parts(&expected, &actual, 5),
            Err(StorageError::PartTooSmall { part_id: 1, .. })
        ));

        // The last part may be short
        assert!(verify_remote_parts(&expected[..1], &actual, 5).is_ok());
    }

    #[test]
    fn test_registry_reports_unconfigured_backend() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry =
            StorageRegistry::new().with_adapter(Arc::new(LocalStorage::new(dir.path().into())));

        assert!(registry.get(BackendKind::Local).is_ok());
        assert!(matches!(
            registry.get(BackendKind::S3),
            Err(StorageError::Unavailable(BackendKind::S3))
        ));
        assert_eq!(registry.kinds(), vec![BackendKind::Local]);
    }
}
