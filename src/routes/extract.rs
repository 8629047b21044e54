//! Request extraction helpers
//!
//! Body extractors that reject with [`AppError`] instead of axum's plain
//! text rejections, and the middleware that resolves the caller's
//! [`Session`] before a protected handler runs.

use std::net::SocketAddr;

use axum::{
    async_trait,
    body::Bytes,
    extract::{ConnectInfo, FromRequest, Request, State},
    http::{header, HeaderValue},
    middleware::Next,
    response::Response,
    Json,
};
use serde::de::DeserializeOwned;

use crate::auth::sessions::SESSION_COOKIE;
use crate::auth::RequestContext;
use crate::error::AppError;
use crate::state::AppState;

/// JSON body; malformed payloads become `invalid_input`
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| AppError::InvalidInput(rejection.body_text()))?;
        Ok(Self(value))
    }
}

/// Raw request body, bounded by the router's body limit
pub struct RawBody(pub Bytes);

#[async_trait]
impl<S> FromRequest<S> for RawBody
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|rejection| AppError::InvalidInput(rejection.body_text()))?;
        Ok(Self(bytes))
    }
}

pub fn session_cookie(key: &str, max_age_secs: i64) -> String {
    format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        SESSION_COOKIE, key, max_age_secs
    )
}

pub fn expired_session_cookie() -> String {
    format!("{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0", SESSION_COOKIE)
}

/// Resolve the caller and hand the [`Session`](crate::auth::Session) and
/// [`RequestContext`] to the handler as request extensions. A freshly
/// created browser session is announced with `Set-Cookie` unless the
/// handler already set one.
pub async fn resolve_session(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let peer_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());

    let ctx = RequestContext::from_headers(request.headers(), peer_ip);
    let session = state.guard().authenticate(&ctx).await?;
    let new_key = session.new_session_key.clone();

    request.extensions_mut().insert(session);
    request.extensions_mut().insert(ctx);

    let mut response = next.run(request).await;

    if let Some(key) = new_key {
        if !response.headers().contains_key(header::SET_COOKIE) {
            let cookie = session_cookie(&key, state.config().auth.session_ttl_secs);
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                response.headers_mut().insert(header::SET_COOKIE, value);
            }
        }
    }

    Ok(response)
}
