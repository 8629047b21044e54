//! S3 multipart-upload backend

use std::collections::HashMap;

use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    compute_checksum, normalize_object_path, verify_remote_parts, BackendHandle, BackendKind,
    PartReceipt, S3Client, StorageAdapter, StorageError,
};

/// S3 rejects non-final parts below 5 MiB
pub const S3_MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Highest part number S3 accepts
pub const S3_MAX_PARTS: u32 = 10_000;

pub struct S3Storage {
    client: S3Client,
    prefix: String,
    /// Multipart uploads started by this process, by upload id
    handles: RwLock<HashMap<Uuid, BackendHandle>>,
}

impl S3Storage {
    pub fn new(client: S3Client, prefix: String) -> Self {
        Self {
            client,
            prefix,
            handles: RwLock::new(HashMap::new()),
        }
    }
}

fn object_key(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        path.to_string()
    } else {
        format!("{}/{}", prefix, path)
    }
}

fn remote_id(handle: &BackendHandle) -> Result<&str, StorageError> {
    handle
        .remote_id
        .as_deref()
        .ok_or(StorageError::NotPrepared(handle.upload_id))
}

#[async_trait::async_trait]
impl StorageAdapter for S3Storage {
    fn kind(&self) -> BackendKind {
        BackendKind::S3
    }

    fn min_part_size(&self) -> u64 {
        S3_MIN_PART_SIZE
    }

    async fn prepare(
        &self,
        upload_id: Uuid,
        object_path: &str,
    ) -> Result<BackendHandle, StorageError> {
        // Held across the create call so two prepares cannot both allocate
        let mut handles = self.handles.write().await;
        if let Some(existing) = handles.get(&upload_id) {
            return Ok(existing.clone());
        }

        let key = object_key(&self.prefix, &normalize_object_path(object_path)?);
        let multipart_id = self.client.create_multipart_upload(&key).await?;

        tracing::info!(
            upload_id = %upload_id,
            key = %key,
            "Started S3 multipart upload"
        );

        let handle = BackendHandle {
            upload_id,
            kind: BackendKind::S3,
            key,
            remote_id: Some(multipart_id),
        };
        handles.insert(upload_id, handle.clone());

        Ok(handle)
    }

    async fn write_part(
        &self,
        handle: &BackendHandle,
        part_id: u32,
        data: &[u8],
    ) -> Result<PartReceipt, StorageError> {
        if part_id == 0 || part_id > S3_MAX_PARTS {
            return Err(StorageError::Remote(format!(
                "part number {} outside 1..={}",
                part_id, S3_MAX_PARTS
            )));
        }

        let multipart_id = remote_id(handle)?;
        let etag = self
            .client
            .upload_part(&handle.key, multipart_id, part_id as i32, data)
            .await?;

        Ok(PartReceipt {
            part_id,
            size: data.len() as u64,
            checksum: compute_checksum(data),
            etag,
        })
    }

    async fn commit(
        &self,
        handle: &BackendHandle,
        parts: &[PartReceipt],
    ) -> Result<String, StorageError> {
        let multipart_id = remote_id(handle)?;

        let remote = self.client.list_parts(&handle.key, multipart_id).await?;
        verify_remote_parts(parts, &remote, S3_MIN_PART_SIZE)?;

        let etag_of = |part_id: u32| {
            remote
                .iter()
                .find(|r| r.part_id == part_id)
                .and_then(|r| r.etag.clone())
        };

        let completed = parts
            .iter()
            .map(|p| {
                p.etag
                    .clone()
                    .or_else(|| etag_of(p.part_id))
                    .map(|etag| (p.part_id as i32, etag))
                    .ok_or_else(|| {
                        StorageError::Divergence(format!("part {} has no ETag", p.part_id))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.client
            .complete_multipart_upload(&handle.key, multipart_id, completed)
            .await?;

        self.handles.write().await.remove(&handle.upload_id);

        tracing::info!(
            upload_id = %handle.upload_id,
            key = %handle.key,
            parts = parts.len(),
            "Completed S3 multipart upload"
        );

        Ok(format!("s3://{}/{}", self.client.bucket(), handle.key))
    }

    async fn abort(&self, handle: &BackendHandle) {
        self.handles.write().await.remove(&handle.upload_id);

        let Some(multipart_id) = handle.remote_id.as_deref() else {
            return;
        };

        if let Err(e) = self
            .client
            .abort_multipart_upload(&handle.key, multipart_id)
            .await
        {
            tracing::warn!(upload_id = %handle.upload_id, error = %e, "Failed to abort S3 multipart upload");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_layout() {
        assert_eq!(object_key("uploads", "backup/db.tar"), "uploads/backup/db.tar");
        assert_eq!(object_key("/uploads/", "db.tar"), "uploads/db.tar");
        assert_eq!(object_key("", "db.tar"), "db.tar");
    }

    #[test]
    fn test_handle_without_multipart_id_is_unprepared() {
        let handle = BackendHandle {
            upload_id: Uuid::new_v4(),
            kind: BackendKind::S3,
            key: "k".into(),
            remote_id: None,
        };
        assert!(matches!(remote_id(&handle), Err(StorageError::NotPrepared(_))));
    }
}
