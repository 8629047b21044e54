//! Upload Ledger
//!
//! Durable bookkeeping of uploads and their received parts. Every state
//! change is a compare-and-swap on `status`, so a terminal upload can never
//! be moved again even if two callers race.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::storage::{BackendHandle, PartReceipt};

use super::types::{NewUpload, UploadSession, UploadStatus};

const OPEN_STATUSES: &str = "('initialized', 'in_progress')";

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Upload not found: {0}")]
    NotFound(Uuid),

    #[error("Part {part_id} already recorded")]
    DuplicatePart { part_id: u32, checksum_matches: bool },

    #[error("Upload is {0}")]
    UploadClosed(UploadStatus),

    #[error("Upload would hold {attempted} bytes, declared {declared}")]
    SizeExceeded { declared: u64, attempted: u64 },

    #[error("Received {received} bytes, declared {declared}")]
    SizeMismatch { declared: u64, received: u64 },

    #[error("Missing parts {0:?}")]
    IncompleteUpload(Vec<u32>),

    #[error("Corrupt ledger row: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

// ============================================================================
// Rows
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
struct UploadRow {
    id: Uuid,
    user_id: Uuid,
    machine_id: Option<i64>,
    path: String,
    backend: String,
    declared_size: i64,
    part_count: Option<i64>,
    received_bytes: i64,
    status: String,
    backend_handle: Option<String>,
    location: Option<String>,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<UploadRow> for UploadSession {
    type Error = LedgerError;

    fn try_from(row: UploadRow) -> Result<Self, Self::Error> {
        let backend_handle = row
            .backend_handle
            .as_deref()
            .map(serde_json::from_str::<BackendHandle>)
            .transpose()
            .map_err(|e| LedgerError::Corrupt(format!("backend handle: {}", e)))?;

        Ok(UploadSession {
            id: row.id,
            user_id: row.user_id,
            machine_id: row.machine_id,
            path: row.path,
            backend: row.backend.parse().map_err(|e| LedgerError::Corrupt(format!("{}", e)))?,
            declared_size: row.declared_size as u64,
            part_count: row.part_count.map(|n| n as u32),
            received_bytes: row.received_bytes as u64,
            status: row.status.parse().map_err(LedgerError::Corrupt)?,
            backend_handle,
            location: row.location,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PartRow {
    part_id: i64,
    size: i64,
    checksum: String,
    etag: Option<String>,
}

impl From<PartRow> for PartReceipt {
    fn from(row: PartRow) -> Self {
        PartReceipt {
            part_id: row.part_id as u32,
            size: row.size as u64,
            checksum: row.checksum,
            etag: row.etag,
        }
    }
}

// ============================================================================
// Completion Rule
// ============================================================================

/// Part ids still needed before an upload can complete. With a declared
/// part count every id in `1..=count` is required; otherwise ids must be
/// contiguous from 1 and, once they are, the next id is missing until the
/// byte total reaches the declared size.
pub fn missing_parts(
    declared_size: u64,
    part_count: Option<u32>,
    parts: &[PartReceipt],
) -> Vec<u32> {
    let present: BTreeSet<u32> = parts.iter().map(|p| p.part_id).collect();

    match part_count {
        Some(count) => (1..=count).filter(|id| !present.contains(id)).collect(),
        None => {
            let highest = present.iter().next_back().copied().unwrap_or(0);
            let gaps: Vec<u32> = (1..=highest).filter(|id| !present.contains(id)).collect();
            let received: u64 = parts.iter().map(|p| p.size).sum();

            if gaps.is_empty() && received < declared_size {
                vec![highest + 1]
            } else {
                gaps
            }
        }
    }
}

// ============================================================================
// Ledger
// ============================================================================

#[derive(Clone)]
pub struct UploadLedger {
    db: SqlitePool,
}

impl UploadLedger {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Open a new entry in `initialized`
    pub async fn create(&self, upload: &NewUpload) -> Result<Uuid, LedgerError> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO uploads (
                id, user_id, machine_id, path, backend, declared_size, part_count,
                received_bytes, status, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, 0, 'initialized', ?, ?)
            "#,
        )
        .bind(id)
        .bind(upload.user_id)
        .bind(upload.machine_id)
        .bind(&upload.path)
        .bind(upload.backend.as_str())
        .bind(upload.declared_size as i64)
        .bind(upload.part_count.map(i64::from))
        .bind(now)
        .bind(now)
        .execute(&self.db)
        .await?;

        Ok(id)
    }

    pub async fn set_backend_handle(
        &self,
        id: Uuid,
        handle: &BackendHandle,
    ) -> Result<(), LedgerError> {
        let encoded =
            serde_json::to_string(handle).map_err(|e| LedgerError::Corrupt(e.to_string()))?;

        let result = sqlx::query(&format!(
            "UPDATE uploads SET backend_handle = ?, updated_at = ? WHERE id = ? AND status IN {}",
            OPEN_STATUSES
        ))
        .bind(encoded)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.closed_or_missing(id).await);
        }

        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<UploadSession, LedgerError> {
        let row = sqlx::query_as::<_, UploadRow>("SELECT * FROM uploads WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.db)
            .await?
            .ok_or(LedgerError::NotFound(id))?;

        row.try_into()
    }

    /// Received parts, ordered by part id
    pub async fn list_parts(&self, id: Uuid) -> Result<Vec<PartReceipt>, LedgerError> {
        let rows = sqlx::query_as::<_, PartRow>(
            r#"
            SELECT part_id, size, checksum, etag
            FROM upload_parts
            WHERE upload_id = ?
            ORDER BY part_id
            "#,
        )
        .bind(id)
        .fetch_all(&self.db)
        .await?;

        Ok(rows.into_iter().map(PartReceipt::from).collect())
    }

    /// Record a staged part exactly once. Moves the upload to
    /// `in_progress`.
    pub async fn record_part(
        &self,
        id: Uuid,
        receipt: &PartReceipt,
    ) -> Result<UploadSession, LedgerError> {
        let mut tx = self.db.begin().await?;

        let row = sqlx::query_as::<_, UploadRow>("SELECT * FROM uploads WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(LedgerError::NotFound(id))?;
        let upload = UploadSession::try_from(row)?;

        if upload.status.is_terminal() {
            return Err(LedgerError::UploadClosed(upload.status));
        }

        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT checksum FROM upload_parts WHERE upload_id = ? AND part_id = ?",
        )
        .bind(id)
        .bind(i64::from(receipt.part_id))
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((checksum,)) = existing {
            return Err(LedgerError::DuplicatePart {
                part_id: receipt.part_id,
                checksum_matches: checksum == receipt.checksum,
            });
        }

        let attempted = upload.received_bytes + receipt.size;
        if attempted > upload.declared_size {
            return Err(LedgerError::SizeExceeded {
                declared: upload.declared_size,
                attempted,
            });
        }

        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO upload_parts (upload_id, part_id, size, checksum, etag, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(i64::from(receipt.part_id))
        .bind(receipt.size as i64)
        .bind(&receipt.checksum)
        .bind(&receipt.etag)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let updated = sqlx::query(&format!(
            r#"
            UPDATE uploads
            SET received_bytes = received_bytes + ?, status = 'in_progress', updated_at = ?
            WHERE id = ? AND status IN {}
            "#,
            OPEN_STATUSES
        ))
        .bind(receipt.size as i64)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() != 1 {
            return Err(LedgerError::UploadClosed(upload.status));
        }

        tx.commit().await?;

        tracing::debug!(
            upload_id = %id,
            part_id = receipt.part_id,
            size = receipt.size,
            received_bytes = attempted,
            "Recorded part"
        );

        Ok(UploadSession {
            received_bytes: attempted,
            status: UploadStatus::InProgress,
            updated_at: now,
            ..upload
        })
    }

    /// The upload and its parts, if every required part is present
    pub async fn ready_to_complete(
        &self,
        id: Uuid,
    ) -> Result<(UploadSession, Vec<PartReceipt>), LedgerError> {
        let upload = self.get(id).await?;
        if upload.status.is_terminal() {
            return Err(LedgerError::UploadClosed(upload.status));
        }

        let parts = self.list_parts(id).await?;
        let missing = missing_parts(upload.declared_size, upload.part_count, &parts);
        if !missing.is_empty() {
            return Err(LedgerError::IncompleteUpload(missing));
        }

        let received: u64 = parts.iter().map(|p| p.size).sum();
        if received != upload.declared_size {
            return Err(LedgerError::SizeMismatch {
                declared: upload.declared_size,
                received,
            });
        }

        Ok((upload, parts))
    }

    /// Terminal. Fails unless every required part is present.
    pub async fn mark_completed(&self, id: Uuid, location: &str) -> Result<(), LedgerError> {
        self.ready_to_complete(id).await?;

        let result = sqlx::query(&format!(
            r#"
            UPDATE uploads SET status = 'completed', location = ?, updated_at = ?
            WHERE id = ? AND status IN {}
            "#,
            OPEN_STATUSES
        ))
        .bind(location)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.closed_or_missing(id).await);
        }

        tracing::info!(upload_id = %id, location = %location, "Upload completed");
        Ok(())
    }

    /// Terminal
    pub async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<(), LedgerError> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE uploads SET status = 'failed', failure_reason = ?, updated_at = ?
            WHERE id = ? AND status IN {}
            "#,
            OPEN_STATUSES
        ))
        .bind(reason)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.closed_or_missing(id).await);
        }

        tracing::warn!(upload_id = %id, reason = %reason, "Upload failed");
        Ok(())
    }

    /// Terminal
    pub async fn mark_aborted(&self, id: Uuid) -> Result<(), LedgerError> {
        let result = sqlx::query(&format!(
            "UPDATE uploads SET status = 'aborted', updated_at = ? WHERE id = ? AND status IN {}",
            OPEN_STATUSES
        ))
        .bind(Utc::now())
        .bind(id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.closed_or_missing(id).await);
        }

        tracing::info!(upload_id = %id, "Upload aborted");
        Ok(())
    }

    /// Open uploads whose last activity is older than `cutoff`
    pub async fn stale_uploads(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>, LedgerError> {
        let rows: Vec<(Uuid, DateTime<Utc>)> = sqlx::query_as(&format!(
            "SELECT id, updated_at FROM uploads WHERE status IN {}",
            OPEN_STATUSES
        ))
        .fetch_all(&self.db)
        .await?;

        Ok(rows
            .into_iter()
            .filter(|(_, updated_at)| *updated_at < cutoff)
            .map(|(id, _)| id)
            .collect())
    }

    async fn closed_or_missing(&self, id: Uuid) -> LedgerError {
        match self.get(id).await {
            Ok(upload) => LedgerError::UploadClosed(upload.status),
            Err(e) => e,
        }
    }

    #[cfg(test)]
    pub(crate) async fn backdate(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), LedgerError> {
        sqlx::query("UPDATE uploads SET updated_at = ? WHERE id = ?")
            .bind(at)
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}
