//! Local filesystem storage
//!
//! Parts are staged under `<root>/.staging/<upload_id>/part-NNNNNN` and
//! committed by concatenating them into `<root>/.staging/<upload_id>/assembled`,
//! which is then renamed onto `<root>/<key>`. Two uploads to one key never
//! share an intermediate file; the last commit replaces the object whole.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::{
    compute_checksum, normalize_object_path, BackendHandle, BackendKind, PartReceipt,
    StorageAdapter, StorageError,
};

const STAGING_DIR: &str = ".staging";

pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn staging_dir(&self, upload_id: Uuid) -> PathBuf {
        self.root.join(STAGING_DIR).join(upload_id.to_string())
    }

    fn part_path(&self, upload_id: Uuid, part_id: u32) -> PathBuf {
        self.staging_dir(upload_id).join(format!("part-{:06}", part_id))
    }

    fn assembly_path(&self, upload_id: Uuid) -> PathBuf {
        self.staging_dir(upload_id).join("assembled")
    }

    fn target_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        let key = normalize_object_path(key)?;
        if key == STAGING_DIR || key.starts_with(&format!("{}/", STAGING_DIR)) {
            return Err(StorageError::InvalidPath(key));
        }
        Ok(self.root.join(key))
    }
}

/// Write to a sibling temp file and rename, so readers only ever see a
/// complete file
async fn write_atomically(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));

    let result = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }

    Ok(result?)
}

#[async_trait::async_trait]
impl StorageAdapter for LocalStorage {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn min_part_size(&self) -> u64 {
        1
    }

    async fn prepare(
        &self,
        upload_id: Uuid,
        object_path: &str,
    ) -> Result<BackendHandle, StorageError> {
        let key = normalize_object_path(object_path)?;
        self.target_path(&key)?;

        tokio::fs::create_dir_all(self.staging_dir(upload_id)).await?;

        Ok(BackendHandle {
            upload_id,
            kind: BackendKind::Local,
            key,
            remote_id: None,
        })
    }

    async fn write_part(
        &self,
        handle: &BackendHandle,
        part_id: u32,
        data: &[u8],
    ) -> Result<PartReceipt, StorageError> {
        let staging = self.staging_dir(handle.upload_id);
        if !tokio::fs::try_exists(&staging).await? {
            return Err(StorageError::NotPrepared(handle.upload_id));
        }

        write_atomically(&self.part_path(handle.upload_id, part_id), data).await?;

        tracing::debug!(
            upload_id = %handle.upload_id,
            part_id = part_id,
            size = data.len(),
            "Staged part on local disk"
        );

        Ok(PartReceipt {
            part_id,
            size: data.len() as u64,
            checksum: compute_checksum(data),
            etag: None,
        })
    }

    async fn commit(
        &self,
        handle: &BackendHandle,
        parts: &[PartReceipt],
    ) -> Result<String, StorageError> {
        let target = self.target_path(&handle.key)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let assembly = self.assembly_path(handle.upload_id);

        let assembled = async {
            let mut out = tokio::fs::File::create(&assembly).await?;

            for part in parts {
                let path = self.part_path(handle.upload_id, part.part_id);
                let data = match tokio::fs::read(&path).await {
                    Ok(data) => data,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(StorageError::Divergence(format!(
                            "part {} is not staged",
                            part.part_id
                        )));
                    }
                    Err(e) => return Err(e.into()),
                };

                if data.len() as u64 != part.size || compute_checksum(&data) != part.checksum {
                    return Err(StorageError::Divergence(format!(
                        "staged part {} does not match its receipt",
                        part.part_id
                    )));
                }

                out.write_all(&data).await?;
            }

            out.sync_all().await?;
            Ok::<(), StorageError>(())
        }
        .await;

        if let Err(e) = assembled {
            let _ = tokio::fs::remove_file(&assembly).await;
            return Err(e);
        }

        tokio::fs::rename(&assembly, &target).await?;

        if let Err(e) = tokio::fs::remove_dir_all(self.staging_dir(handle.upload_id)).await {
            tracing::warn!(upload_id = %handle.upload_id, error = %e, "Failed to remove staging directory");
        }

        tracing::info!(
            upload_id = %handle.upload_id,
            parts = parts.len(),
            target = %target.display(),
            "Committed upload to local disk"
        );

        Ok(target.display().to_string())
    }

    async fn abort(&self, handle: &BackendHandle) {
        match tokio::fs::remove_dir_all(self.staging_dir(handle.upload_id)).await {
            Ok(()) => {
                tracing::debug!(upload_id = %handle.upload_id, "Removed staged parts");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(upload_id = %handle.upload_id, error = %e, "Failed to remove staged parts");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_stage_and_commit() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path().to_path_buf());
        let id = Uuid::new_v4();

        let handle = storage.prepare(id, "backup/db.tar").await.unwrap();
        assert_eq!(storage.prepare(id, "backup/db.tar").await.unwrap(), handle);

        let second = storage.write_part(&handle, 2, b"world").await.unwrap();
        let first = storage.write_part(&handle, 1, b"hello ").await.unwrap();

        let location = storage.commit(&handle, &[first, second]).await.unwrap();
        let written = tokio::fs::read(&location).await.unwrap();
        assert_eq!(written, b"hello world");
        assert!(!dir.path().join(STAGING_DIR).join(id.to_string()).exists());
    }

    #[tokio::test]
    async fn test_rewrite_replaces_whole_part() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path().to_path_buf());
        let handle = storage.prepare(Uuid::new_v4(), "f.bin").await.unwrap();

        storage.write_part(&handle, 1, b"first attempt").await.unwrap();
        let receipt = storage.write_part(&handle, 1, b"retry").await.unwrap();

        let location = storage.commit(&handle, &[receipt]).await.unwrap();
        assert_eq!(tokio::fs::read(location).await.unwrap(), b"retry");
    }

    #[tokio::test]
    async fn test_commit_detects_divergence() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path().to_path_buf());
        let handle = storage.prepare(Uuid::new_v4(), "f.bin").await.unwrap();

        let receipt = storage.write_part(&handle, 1, b"abc").await.unwrap();
        let phantom = PartReceipt {
            part_id: 2,
            size: 3,
            checksum: compute_checksum(b"def"),
            etag: None,
        };

        let err = storage.commit(&handle, &[receipt, phantom]).await.unwrap_err();
        assert!(err.is_verification_failure());
        assert!(!dir.path().join("f.bin").exists());
        assert!(!storage.assembly_path(handle.upload_id).exists());
    }

    #[tokio::test]
    async fn test_concurrent_commits_to_one_key_stay_whole() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path().to_path_buf());

        let first = storage.prepare(Uuid::new_v4(), "shared/f.bin").await.unwrap();
        let second = storage.prepare(Uuid::new_v4(), "shared/f.bin").await.unwrap();

        let a = vec![b'a'; 256 * 1024];
        let b = vec![b'b'; 256 * 1024];
        let mut first_parts = Vec::new();
        let mut second_parts = Vec::new();
        for n in 1..=4 {
            first_parts.push(storage.write_part(&first, n, &a).await.unwrap());
            second_parts.push(storage.write_part(&second, n, &b).await.unwrap());
        }

        let (left, right) = tokio::join!(
            storage.commit(&first, &first_parts),
            storage.commit(&second, &second_parts)
        );
        assert_eq!(left.unwrap(), right.unwrap());

        let written = tokio::fs::read(dir.path().join("shared/f.bin")).await.unwrap();
        assert_eq!(written.len(), 4 * 256 * 1024);
        assert!(written.iter().all(|&c| c == b'a') || written.iter().all(|&c| c == b'b'));
    }

    #[tokio::test]
    async fn test_abort_and_unprepared_writes() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path().to_path_buf());
        let handle = storage.prepare(Uuid::new_v4(), "f.bin").await.unwrap();

        storage.write_part(&handle, 1, b"abc").await.unwrap();
        storage.abort(&handle).await;
        storage.abort(&handle).await;

        assert!(matches!(
            storage.write_part(&handle, 2, b"def").await,
            Err(StorageError::NotPrepared(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_paths_outside_root() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path().to_path_buf());

        assert!(storage.prepare(Uuid::new_v4(), "../escape").await.is_err());
        assert!(storage.prepare(Uuid::new_v4(), ".staging/x").await.is_err());
    }
}
