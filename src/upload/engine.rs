//! Upload Engine
//!
//! Orchestrates init → part upload → completion. Bytes go to a
//! [`StorageAdapter`], bookkeeping to the [`UploadLedger`].
//!
//! Locking:
//! - a per-upload lock guards every ledger read-validate-write sequence;
//! - `upload_part` releases it during the backend write and instead marks
//!   the `(upload, part)` pair as in flight, so the same part cannot be
//!   written twice at once;
//! - `complete` holds it across the backend commit, so at most one commit
//!   per upload ever reaches the backend.
//!
//! Objects are stored under `<user_id>/<path>`: two owners never share a key.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::auth::Session;
use crate::config::UploadConfig;
use crate::event_log::{Category, EventLog, Severity};
use crate::heartbeat::HeartbeatRegistrar;
use crate::locks::KeyedLocks;
use crate::storage::{
    compute_checksum, normalize_object_path, BackendHandle, BackendKind, PartReceipt,
    StorageAdapter, StorageRegistry,
};

use super::ledger::{LedgerError, UploadLedger};
use super::types::{
    InitRequest, NewUpload, UploadError, UploadSession, UploadStatus, UploadStatusResponse,
};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_backend: BackendKind,
    pub max_upload_bytes: u64,
    /// Open uploads idle longer than this are swept by the janitor
    pub stale_after: Duration,
}

impl EngineConfig {
    pub fn from_upload_config(config: &UploadConfig) -> Self {
        Self {
            default_backend: config.default_backend,
            max_upload_bytes: config.max_upload_bytes,
            stale_after: Duration::seconds(config.stale_upload_secs),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_backend: BackendKind::Local,
            max_upload_bytes: 50 * 1024 * 1024 * 1024,
            stale_after: Duration::hours(24),
        }
    }
}

type InFlight = Mutex<HashSet<(Uuid, u32)>>;

/// Clears an in-flight part marker when the write finishes or fails
struct InFlightGuard<'a> {
    set: &'a InFlight,
    key: (Uuid, u32),
}

impl<'a> InFlightGuard<'a> {
    fn claim(set: &'a InFlight, upload_id: Uuid, part_id: u32) -> Option<Self> {
        let key = (upload_id, part_id);
        set.lock().insert(key).then(|| Self { set, key })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}

#[derive(Clone)]
pub struct UploadEngine {
    inner: Arc<UploadEngineInner>,
}

struct UploadEngineInner {
    ledger: UploadLedger,
    storage: StorageRegistry,
    machines: HeartbeatRegistrar,
    event_log: EventLog,
    locks: KeyedLocks<Uuid>,
    in_flight: InFlight,
    config: EngineConfig,
}

impl UploadEngine {
    pub fn new(
        ledger: UploadLedger,
        storage: StorageRegistry,
        machines: HeartbeatRegistrar,
        event_log: EventLog,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(UploadEngineInner {
                ledger,
                storage,
                machines,
                event_log,
                locks: KeyedLocks::new(),
                in_flight: Mutex::new(HashSet::new()),
                config,
            }),
        }
    }

    pub fn ledger(&self) -> &UploadLedger {
        &self.inner.ledger
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Validate metadata, open a ledger entry and prepare the backend
    pub async fn init(&self, session: &Session, request: &InitRequest) -> Result<Uuid, UploadError> {
        let user_id = session.require_user()?;

        let path = normalize_object_path(&request.path)
            .map_err(|_| UploadError::InvalidMetadata(format!("invalid path {:?}", request.path)))?;

        if request.size == 0 {
            return Err(UploadError::InvalidMetadata("size must be greater than zero".into()));
        }
        if request.size > self.inner.config.max_upload_bytes {
            return Err(UploadError::InvalidMetadata(format!(
                "size {} exceeds the limit of {} bytes",
                request.size, self.inner.config.max_upload_bytes
            )));
        }
        match request.parts {
            Some(0) => {
                return Err(UploadError::InvalidMetadata("an upload needs at least one part".into()))
            }
            Some(n) if u64::from(n) > request.size => {
                return Err(UploadError::InvalidMetadata(format!(
                    "{} parts cannot carry {} bytes",
                    n, request.size
                )))
            }
            _ => {}
        }

        let backend = match request.backend.as_deref() {
            Some(name) => name.parse::<BackendKind>()?,
            None => self.inner.config.default_backend,
        };
        let adapter = self.inner.storage.get(backend)?;

        let machine_id = match request.host_name.as_deref() {
            Some(host) => self
                .inner
                .machines
                .machine_id_for_host(host)
                .await
                .map_err(|e| UploadError::Backend(e.to_string()))?,
            None => None,
        };

        let upload_id = self
            .inner
            .ledger
            .create(&NewUpload {
                user_id,
                machine_id,
                path: path.clone(),
                backend,
                declared_size: request.size,
                part_count: request.parts,
            })
            .await?;

        let handle = match adapter.prepare(upload_id, &object_key(user_id, &path)).await {
            Ok(handle) => handle,
            Err(e) => {
                let _ = self.inner.ledger.mark_failed(upload_id, &e.to_string()).await;
                return Err(e.into());
            }
        };
        self.inner.ledger.set_backend_handle(upload_id, &handle).await?;

        tracing::info!(
            upload_id = %upload_id,
            user_id = %user_id,
            path = %path,
            backend = %backend,
            size = request.size,
            parts = ?request.parts,
            "Initialized upload"
        );

        Ok(upload_id)
    }

    /// Stage one part and record it. Resending a recorded part with the same
    /// bytes returns the original receipt; different bytes are a conflict.
    pub async fn upload_part(
        &self,
        session: &Session,
        upload_id: Uuid,
        part_id: u32,
        data: &[u8],
    ) -> Result<PartReceipt, UploadError> {
        let user_id = session.require_user()?;

        if part_id == 0 {
            return Err(UploadError::InvalidMetadata("part numbers start at 1".into()));
        }
        if data.is_empty() {
            return Err(UploadError::InvalidMetadata("part is empty".into()));
        }

        let (adapter, handle, _in_flight) = {
            let _lock = self.inner.locks.lock(&upload_id).await;
            let upload = self.owned_upload(user_id, upload_id).await?;
            ensure_open(&upload)?;

            if let Some(count) = upload.part_count {
                if part_id > count {
                    return Err(UploadError::InvalidMetadata(format!(
                        "part {} is beyond the declared {} parts",
                        part_id, count
                    )));
                }
            }

            let parts = self.inner.ledger.list_parts(upload_id).await?;
            if let Some(existing) = parts.iter().find(|p| p.part_id == part_id) {
                return resend(existing, data);
            }

            let size = data.len() as u64;
            if upload.received_bytes + size > upload.declared_size {
                return Err(UploadError::InvalidMetadata(format!(
                    "part {} would exceed the declared size of {} bytes",
                    part_id, upload.declared_size
                )));
            }

            let adapter = self.inner.storage.get(upload.backend)?;
            let is_last = match upload.part_count {
                Some(count) => part_id == count,
                None => upload.received_bytes + size == upload.declared_size,
            };
            if upload.part_count.is_some() && !is_last && size < adapter.min_part_size() {
                return Err(UploadError::InvalidMetadata(format!(
                    "part {} is {} bytes; {} backend needs at least {}",
                    part_id,
                    size,
                    upload.backend,
                    adapter.min_part_size()
                )));
            }

            let handle = backend_handle(&upload)?;
            let in_flight = InFlightGuard::claim(&self.inner.in_flight, upload_id, part_id)
                .ok_or_else(|| {
                    UploadError::Conflict(format!("Part {} is already being uploaded", part_id))
                })?;

            (adapter, handle, in_flight)
        };

        // Nothing is recorded if the backend write fails
        let receipt = adapter.write_part(&handle, part_id, data).await?;

        let _lock = self.inner.locks.lock(&upload_id).await;
        match self.inner.ledger.record_part(upload_id, &receipt).await {
            Ok(upload) => {
                tracing::debug!(
                    upload_id = %upload_id,
                    part_id = part_id,
                    received_bytes = upload.received_bytes,
                    "Part received"
                );
                Ok(receipt)
            }
            Err(LedgerError::DuplicatePart { checksum_matches: true, .. }) => Ok(receipt),
            Err(LedgerError::UploadClosed(status)) => {
                // Aborted while the bytes were in flight
                if status != UploadStatus::Completed {
                    adapter.abort(&handle).await;
                }
                Err(UploadError::Conflict(format!("Upload is already {}", status)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Commit all recorded parts exactly once
    pub async fn complete(&self, session: &Session, upload_id: Uuid) -> Result<String, UploadError> {
        let user_id = session.require_user()?;

        let _lock = self.inner.locks.lock(&upload_id).await;
        let upload = self.owned_upload(user_id, upload_id).await?;
        ensure_open(&upload)?;

        if self.has_parts_in_flight(upload_id) {
            return Err(UploadError::Conflict("Parts are still being uploaded".into()));
        }

        let (upload, parts) = self.inner.ledger.ready_to_complete(upload.id).await?;
        let handle = backend_handle(&upload)?;
        let adapter = self.inner.storage.get(upload.backend)?;

        match adapter.commit(&handle, &parts).await {
            Ok(location) => {
                self.inner.ledger.mark_completed(upload_id, &location).await?;
                tracing::debug!(upload_id = %upload_id, location = %location, "Upload committed");
                self.inner
                    .event_log
                    .info(
                        Some(user_id),
                        &format!(
                            "Upload completed (Path={}, Bytes={}, Backend={})",
                            upload.path, upload.declared_size, upload.backend
                        ),
                        Category::Upload,
                    )
                    .await;
                Ok(location)
            }
            Err(e) if e.is_verification_failure() => {
                self.inner
                    .event_log
                    .error(
                        Some(user_id),
                        &format!("Upload {} failed verification: {}", upload_id, e),
                        Category::Upload,
                    )
                    .await;
                if let Err(mark) = self.inner.ledger.mark_failed(upload_id, &e.to_string()).await {
                    tracing::warn!(upload_id = %upload_id, error = %mark, "Failed to mark upload failed");
                }
                adapter.abort(&handle).await;
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Cancel an upload. Terminal uploads are left as they are.
    pub async fn abort(&self, session: &Session, upload_id: Uuid) -> Result<(), UploadError> {
        let user_id = session.require_user()?;

        let _lock = self.inner.locks.lock(&upload_id).await;
        let upload = self.owned_upload(user_id, upload_id).await?;
        self.abort_locked(&upload).await
    }

    pub async fn status(
        &self,
        session: &Session,
        upload_id: Uuid,
    ) -> Result<UploadStatusResponse, UploadError> {
        let user_id = session.require_user()?;
        let upload = self.owned_upload(user_id, upload_id).await?;
        let parts = self.inner.ledger.list_parts(upload_id).await?;

        Ok(UploadStatusResponse {
            upload_id,
            path: upload.path,
            backend: upload.backend,
            status: upload.status,
            declared_size: upload.declared_size,
            received_bytes: upload.received_bytes,
            part_count: upload.part_count,
            received_parts: parts.iter().map(|p| p.part_id).collect(),
            location: upload.location,
            failure_reason: upload.failure_reason,
        })
    }

    /// Init, one part and completion in a single call
    pub async fn upload_single(
        &self,
        session: &Session,
        path: &str,
        backend: Option<String>,
        host_name: Option<String>,
        data: &[u8],
    ) -> Result<(Uuid, String), UploadError> {
        let request = InitRequest {
            path: path.to_string(),
            size: data.len() as u64,
            backend,
            parts: Some(1),
            host_name,
        };

        let upload_id = self.init(session, &request).await?;

        let result = async {
            self.upload_part(session, upload_id, 1, data).await?;
            self.complete(session, upload_id).await
        }
        .await;

        match result {
            Ok(location) => Ok((upload_id, location)),
            Err(e) => {
                let _ = self.abort(session, upload_id).await;
                Err(e)
            }
        }
    }

    // ========================================================================
    // Janitor
    // ========================================================================

    /// Abort open uploads idle longer than the configured TTL
    pub async fn sweep_stale(&self) -> Result<usize, UploadError> {
        let cutoff = Utc::now() - self.inner.config.stale_after;
        let candidates = self.inner.ledger.stale_uploads(cutoff).await?;

        let mut swept = 0;
        for upload_id in candidates {
            let _lock = self.inner.locks.lock(&upload_id).await;

            // Re-check under the lock; a part may have landed meanwhile
            let upload = match self.inner.ledger.get(upload_id).await {
                Ok(upload) => upload,
                Err(_) => continue,
            };
            if upload.status.is_terminal() || upload.updated_at >= cutoff {
                continue;
            }
            if self.has_parts_in_flight(upload_id) {
                continue;
            }

            match self.abort_locked(&upload).await {
                Ok(()) => swept += 1,
                Err(e) => {
                    self.inner
                        .event_log
                        .record(
                            Some(upload.user_id),
                            &format!("Failed to sweep upload {}: {}", upload_id, e),
                            Category::Janitor,
                            Severity::Warning,
                        )
                        .await;
                }
            }
        }

        if swept > 0 {
            tracing::info!(count = swept, "Swept stale uploads");
        }

        Ok(swept)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Another user's upload is reported as missing
    async fn owned_upload(&self, user_id: Uuid, upload_id: Uuid) -> Result<UploadSession, UploadError> {
        let upload = self.inner.ledger.get(upload_id).await?;
        if upload.user_id != user_id {
            return Err(UploadError::NotFound(upload_id));
        }
        Ok(upload)
    }

    async fn abort_locked(&self, upload: &UploadSession) -> Result<(), UploadError> {
        if upload.status.is_terminal() {
            return Ok(());
        }

        match self.inner.ledger.mark_aborted(upload.id).await {
            Ok(()) | Err(LedgerError::UploadClosed(_)) => {}
            Err(e) => return Err(e.into()),
        }

        if let (Some(handle), Ok(adapter)) = (
            upload.backend_handle.as_ref(),
            self.inner.storage.get(upload.backend),
        ) {
            adapter.abort(handle).await;
        }

        Ok(())
    }

    fn has_parts_in_flight(&self, upload_id: Uuid) -> bool {
        self.inner
            .in_flight
            .lock()
            .iter()
            .any(|(id, _)| *id == upload_id)
    }
}

/// Backend key for a user's object path
fn object_key(user_id: Uuid, path: &str) -> String {
    format!("{}/{}", user_id, path)
}

fn ensure_open(upload: &UploadSession) -> Result<(), UploadError> {
    match upload.status {
        UploadStatus::Completed => Err(UploadError::Conflict("Upload already completed".into())),
        status if status.is_terminal() => {
            Err(UploadError::Conflict(format!("Upload is already {}", status)))
        }
        _ => Ok(()),
    }
}

fn backend_handle(upload: &UploadSession) -> Result<BackendHandle, UploadError> {
    upload
        .backend_handle
        .clone()
        .ok_or_else(|| UploadError::Backend(format!("upload {} was never prepared", upload.id)))
}

fn resend(existing: &PartReceipt, data: &[u8]) -> Result<PartReceipt, UploadError> {
    if existing.size == data.len() as u64 && existing.checksum == compute_checksum(data) {
        Ok(existing.clone())
    } else {
        Err(UploadError::Conflict(format!(
            "Part {} was already received with different content",
            existing.part_id
        )))
    }
}
