//! Authentication Routes
//!
//! Endpoints:
//! - POST /activate - Activate an agent account and issue its first tokens
//! - POST /login - Start a fresh browser session bound to the user
//! - POST /logout - Expire the browser session
//! - POST /token/refresh - Rotate a refresh token

use axum::{
    extract::State,
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::extract::{expired_session_cookie, session_cookie, JsonBody};
use crate::auth::{AuthError, RequestContext, Session};
use crate::error::AppError;
use crate::event_log::Category;
use crate::state::AppState;

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ActivateRequest {
    pub user_name: String,
    pub activation_code: String,
}

#[derive(Debug, Serialize)]
pub struct ActivateResponse {
    pub user_id: Uuid,
    pub user_name: String,
    /// Only issued on first activation
    pub access_token: Option<String>,
    pub refresh_token: String,
    pub token_expiry: Option<i64>,
    pub is_activated: bool,
    pub message: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub user_name: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user_id: Uuid,
    pub message: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub user_id: String,
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix timestamp, seconds
    pub token_expiry: i64,
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /activate
pub async fn activate(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<ActivateRequest>,
) -> Result<Json<ActivateResponse>, AppError> {
    let user_name = request.user_name.trim();
    let code = request.activation_code.trim();
    if user_name.is_empty() || code.is_empty() {
        return Err(AppError::InvalidInput(
            "user_name and activation_code are required".into(),
        ));
    }

    let outcome = state.users().activate(user_name, code).await?;

    let access = if outcome.was_activated {
        None
    } else {
        Some(state.tokens().issue_access_token(outcome.user_id).await?)
    };
    let refresh = state.tokens().issue_refresh_token(outcome.user_id).await?;

    let message = if outcome.was_activated {
        "User is already activated"
    } else {
        "User has been successfully activated"
    };

    state
        .event_log()
        .info(Some(outcome.user_id), message, Category::Authentication)
        .await;

    Ok(Json(ActivateResponse {
        user_id: outcome.user_id,
        user_name: user_name.to_string(),
        token_expiry: access.as_ref().map(|a| a.expires_at.timestamp()),
        access_token: access.map(|a| a.token),
        refresh_token: refresh.token,
        is_activated: true,
        message,
    }))
}

/// POST /login
pub async fn login(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Extension(ctx): Extension<RequestContext>,
    JsonBody(request): JsonBody<LoginRequest>,
) -> Result<Response, AppError> {
    let user_id = match state
        .users()
        .verify_credentials(&request.user_name, &request.password)
        .await
    {
        Ok(user_id) => user_id,
        Err(AuthError::InvalidCredentials) => {
            tracing::info!(user_name = %request.user_name, "Login rejected");
            return Err(AuthError::InvalidCredentials.into());
        }
        Err(e) => return Err(e.into()),
    };

    let key = state
        .guard()
        .login(&session, user_id, ctx.ip_address.as_deref())
        .await?;

    state
        .event_log()
        .info(Some(user_id), "User logged in", Category::Authentication)
        .await;

    let mut response = Json(LoginResponse {
        user_id,
        message: "Login successful",
    })
    .into_response();

    // The pre-login key is dead; the client must switch to this one
    let cookie = session_cookie(&key, state.config().auth.session_ttl_secs);
    let value = HeaderValue::from_str(&cookie).map_err(|e| AppError::Backend(e.to_string()))?;
    response.headers_mut().insert(header::SET_COOKIE, value);

    Ok(response)
}

/// POST /logout
pub async fn logout(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<Response, AppError> {
    state.guard().logout(&session).await?;

    if let Some(user_id) = session.user_id {
        state
            .event_log()
            .info(Some(user_id), "User logged out", Category::Authentication)
            .await;
    }

    let mut response = Json(serde_json::json!({ "message": "Logged out" })).into_response();
    response.headers_mut().insert(
        header::SET_COOKIE,
        HeaderValue::from_str(&expired_session_cookie())
            .map_err(|e| AppError::Backend(e.to_string()))?,
    );

    Ok(response)
}

/// POST /token/refresh
pub async fn refresh_token(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<RefreshRequest>,
) -> Result<Json<RefreshResponse>, AppError> {
    // A malformed user id gets the same answer as a wrong token
    let user_id = Uuid::parse_str(request.user_id.trim()).map_err(|_| AppError::InvalidToken)?;

    let pair = state.tokens().refresh(user_id, &request.refresh_token).await?;

    Ok(Json(RefreshResponse {
        token_expiry: pair.access.expires_at.timestamp(),
        access_token: pair.access.token,
        refresh_token: pair.refresh.token,
    }))
}
