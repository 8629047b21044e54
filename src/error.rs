//! Error types for the Vessel server

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::auth::AuthError;
use crate::event_log::{Category, Severity};
use crate::upload::UploadError;

/// Application-wide result type
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error type, one variant per error kind exposed to clients
#[derive(Error, Debug)]
pub enum AppError {
    #[error("{message}")]
    Unauthorized {
        message: String,
        token_expired: bool,
        authenticated: bool,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Refresh failures never say which half of the credential was wrong
    #[error("The provided token is invalid")]
    InvalidToken,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Upload is incomplete")]
    IncompleteUpload { missing_parts: Vec<u32> },

    #[error("This HTTP method is not supported")]
    MethodNotAllowed,

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl AppError {
    pub fn unauthorized(token_expired: bool, authenticated: bool) -> Self {
        AppError::Unauthorized {
            message: "You are not authorized to perform this action".to_string(),
            token_expired,
            authenticated,
        }
    }

    /// Machine-readable error kind
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Unauthorized { .. } => "unauthorized",
            AppError::InvalidInput(_) => "invalid_input",
            AppError::InvalidToken => "invalid_token",
            AppError::Conflict(_) => "conflict",
            AppError::NotFound(_) => "not_found",
            AppError::IncompleteUpload { .. } => "incomplete_upload",
            AppError::MethodNotAllowed => "method_not_allowed",
            AppError::Backend(_) | AppError::Database(_) => "backend_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            AppError::InvalidInput(_) | AppError::InvalidToken => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) | AppError::IncompleteUpload { .. } => StatusCode::CONFLICT,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            AppError::Backend(_) | AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn category(&self) -> Category {
        match self {
            AppError::Unauthorized { .. } | AppError::InvalidToken => Category::Authentication,
            _ => Category::Api,
        }
    }

    pub fn severity(&self) -> Severity {
        if self.status_code().is_server_error() {
            Severity::Error
        } else {
            Severity::Warning
        }
    }

    /// Message safe to show to clients; internals stay in the logs
    fn public_message(&self) -> String {
        match self {
            AppError::Backend(_) | AppError::Database(_) => {
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// Attached to error responses so the event log middleware can record them
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub message: String,
    pub category: Category,
    pub severity: Severity,
}

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    kind: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    token_expired: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    authenticated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    missing_parts: Option<Vec<u32>>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!(kind = self.kind(), "Request failed: {}", self);
        } else {
            tracing::debug!(kind = self.kind(), "Request rejected: {}", self);
        }

        let (token_expired, authenticated) = match &self {
            AppError::Unauthorized {
                token_expired,
                authenticated,
                ..
            } => (Some(*token_expired), Some(*authenticated)),
            _ => (None, None),
        };

        let missing_parts = match &self {
            AppError::IncompleteUpload { missing_parts } => Some(missing_parts.clone()),
            _ => None,
        };

        let record = ErrorRecord {
            message: self.to_string(),
            category: self.category(),
            severity: self.severity(),
        };

        let body = Json(ErrorEnvelope {
            error: ErrorBody {
                kind: self.kind(),
                message: self.public_message(),
                token_expired,
                authenticated,
                missing_parts,
            },
        });

        let mut response = (status, body).into_response();
        response.extensions_mut().insert(record);
        response
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidToken => AppError::InvalidToken,
            AuthError::InvalidCredentials => AppError::unauthorized(false, false),
            AuthError::Database(e) => AppError::Database(e),
            AuthError::PasswordHash(msg) => AppError::Backend(msg),
        }
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::Unauthorized {
                token_expired,
                authenticated,
            } => AppError::unauthorized(token_expired, authenticated),
            UploadError::InvalidMetadata(msg) => AppError::InvalidInput(msg),
            UploadError::NotFound(id) => AppError::NotFound(format!("Upload {}", id)),
            UploadError::Conflict(msg) => AppError::Conflict(msg),
            UploadError::IncompleteUpload { missing_parts } => {
                AppError::IncompleteUpload { missing_parts }
            }
            UploadError::Backend(msg) => AppError::Backend(msg),
        }
    }
}
