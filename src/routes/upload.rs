//! Upload Routes
//!
//! HTTP endpoints for resumable multipart uploads.
//!
//! Endpoints:
//! - POST /upload - Open an upload, returns its id
//! - GET /upload/:id - Upload status and received parts
//! - PUT /upload/:id - Send one part; `X-Part-Number` names it
//! - POST /upload/:id/complete - Commit the object
//! - DELETE /upload/:id - Abort
//! - POST /file - Single-shot `multipart/form-data` upload

use axum::{
    body::Bytes,
    extract::{multipart::MultipartRejection, Multipart, Path, State},
    http::HeaderMap,
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::extract::{JsonBody, RawBody};
use crate::auth::Session;
use crate::error::AppError;
use crate::state::AppState;
use crate::upload::{
    CompleteResponse, InitRequest, InitResponse, PartResponse, UploadStatus, UploadStatusResponse,
};

pub const PART_NUMBER_HEADER: &str = "x-part-number";

#[derive(Debug, Serialize)]
pub struct AbortResponse {
    pub upload_id: Uuid,
    pub status: UploadStatus,
}

/// `metadata` field of a single-shot upload; the size is the file's
#[derive(Debug, Deserialize)]
pub struct FileMetadata {
    pub path: String,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub host_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FileUploadResponse {
    pub upload_id: Uuid,
    pub location: String,
    pub message: &'static str,
}

/// Unparseable ids are reported like unknown ones
fn parse_upload_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::NotFound(format!("Upload {}", raw)))
}

fn part_number(headers: &HeaderMap) -> Result<u32, AppError> {
    let raw = headers
        .get(PART_NUMBER_HEADER)
        .ok_or_else(|| AppError::InvalidInput("X-Part-Number header is required".into()))?;

    raw.to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .filter(|n| *n >= 1)
        .ok_or_else(|| AppError::InvalidInput("X-Part-Number must be a number from 1".into()))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /upload
pub async fn init_upload(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    JsonBody(request): JsonBody<InitRequest>,
) -> Result<Json<InitResponse>, AppError> {
    let upload_id = state.engine().init(&session, &request).await?;
    Ok(Json(InitResponse { upload_id }))
}

/// GET /upload/:id
pub async fn upload_status(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<String>,
) -> Result<Json<UploadStatusResponse>, AppError> {
    let upload_id = parse_upload_id(&id)?;
    let status = state.engine().status(&session, upload_id).await?;
    Ok(Json(status))
}

/// PUT /upload/:id
///
/// The body is the raw part.
pub async fn upload_part(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<String>,
    headers: HeaderMap,
    RawBody(body): RawBody,
) -> Result<Json<PartResponse>, AppError> {
    // Authentication is checked before anything about the request shape
    state.guard().require_authenticated(&session)?;

    let upload_id = parse_upload_id(&id)?;
    let part_id = part_number(&headers)?;

    let receipt = state
        .engine()
        .upload_part(&session, upload_id, part_id, &body)
        .await?;

    Ok(Json(PartResponse {
        part_id: receipt.part_id,
        size: receipt.size,
        checksum: receipt.checksum,
    }))
}

/// POST /upload/:id/complete
pub async fn complete_upload(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<String>,
) -> Result<Json<CompleteResponse>, AppError> {
    let upload_id = parse_upload_id(&id)?;
    let location = state.engine().complete(&session, upload_id).await?;
    Ok(Json(CompleteResponse { location }))
}

/// DELETE /upload/:id
pub async fn abort_upload(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<String>,
) -> Result<Json<AbortResponse>, AppError> {
    let upload_id = parse_upload_id(&id)?;
    state.engine().abort(&session, upload_id).await?;

    // Aborting a finished upload leaves it as it was
    let current = state.engine().status(&session, upload_id).await?;
    Ok(Json(AbortResponse {
        upload_id,
        status: current.status,
    }))
}

/// POST /file
///
/// Fields: `metadata` (JSON) and `fileContent` (bytes). Other fields are
/// skipped.
pub async fn upload_file(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    form: Result<Multipart, MultipartRejection>,
) -> Result<Json<FileUploadResponse>, AppError> {
    state.guard().require_authenticated(&session)?;
    let mut multipart = form.map_err(|e| AppError::InvalidInput(e.body_text()))?;

    let mut metadata: Option<FileMetadata> = None;
    let mut content: Option<Bytes> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::InvalidInput(e.body_text()))?
    {
        let name = field.name().unwrap_or("").to_string();
        tracing::debug!(name = %name, filename = ?field.file_name(), "Received form field");

        match name.as_str() {
            "metadata" => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::InvalidInput(e.body_text()))?;
                let parsed = serde_json::from_slice(&data)
                    .map_err(|e| AppError::InvalidInput(format!("JSON payload is invalid: {}", e)))?;
                metadata = Some(parsed);
            }
            "fileContent" => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::InvalidInput(e.body_text()))?;
                content = Some(data);
            }
            _ => {}
        }
    }

    let metadata = metadata.ok_or_else(|| AppError::InvalidInput("File metadata is missing".into()))?;
    let content = content.ok_or_else(|| AppError::InvalidInput("File content is missing".into()))?;

    let (upload_id, location) = state
        .engine()
        .upload_single(
            &session,
            &metadata.path,
            metadata.backend,
            metadata.host_name,
            &content,
        )
        .await?;

    Ok(Json(FileUploadResponse {
        upload_id,
        location,
        message: "File was uploaded successfully",
    }))
}
