//! Sessions and the session guard
//!
//! Browser sessions are created on first contact, bumped on every request
//! and expire for good once `now >= last_accessed + ttl` or on logout.
//! Expiry is evaluated lazily at point of use; the janitor later deletes
//! rows that can no longer authenticate.

use std::sync::Arc;

use axum::http::{header, HeaderMap};
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::crypto::{generate_token, hash_session_key};
use super::tokens::TokenStore;
use super::AuthError;
use sqlx::SqlitePool;

/// Name of the browser session cookie
pub const SESSION_COOKIE: &str = "session_key";

/// Credentials pulled off an inbound request
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub bearer_token: Option<String>,
    pub session_key: Option<String>,
    pub ip_address: Option<String>,
}

impl RequestContext {
    pub fn from_headers(headers: &HeaderMap, peer_ip: Option<String>) -> Self {
        let bearer_token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let session_key = headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == SESSION_COOKIE)
            .map(|(_, value)| value.to_string())
            .filter(|v| !v.is_empty());

        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        Self {
            bearer_token,
            session_key,
            ip_address: forwarded.or(peer_ip),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    AccessToken,
    SessionCookie,
    Anonymous,
}

/// The resolved caller. Unauthenticated callers still get a `Session`;
/// handlers decide whether that is acceptable.
#[derive(Debug, Clone)]
pub struct Session {
    pub method: AuthMethod,
    /// Digest of the browser session key, when the caller has one
    pub handle: Option<String>,
    pub user_id: Option<Uuid>,
    pub authenticated: bool,
    pub token_expired: bool,
    /// Freshly minted cookie value the response must set
    pub new_session_key: Option<String>,
}

impl Session {
    pub fn anonymous() -> Self {
        Self {
            method: AuthMethod::Anonymous,
            handle: None,
            user_id: None,
            authenticated: false,
            token_expired: false,
            new_session_key: None,
        }
    }

    /// An authenticated agent session, as resolved from a valid bearer token
    pub fn for_user(user_id: Uuid) -> Self {
        Self {
            method: AuthMethod::AccessToken,
            user_id: Some(user_id),
            authenticated: true,
            ..Self::anonymous()
        }
    }

    /// The authenticated user, or the flags a client needs to decide
    /// between refreshing and logging in again
    pub fn require_user(&self) -> Result<Uuid, Unauthenticated> {
        match self.user_id {
            Some(user_id) if self.authenticated => Ok(user_id),
            _ => Err(Unauthenticated {
                token_expired: self.token_expired,
                authenticated: self.authenticated,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("not authenticated")]
pub struct Unauthenticated {
    pub token_expired: bool,
    pub authenticated: bool,
}

impl From<Unauthenticated> for crate::error::AppError {
    fn from(err: Unauthenticated) -> Self {
        crate::error::AppError::unauthorized(err.token_expired, err.authenticated)
    }
}

/// A persisted browser session
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRecord {
    pub id: i64,
    pub session_hash: String,
    pub user_id: Option<Uuid>,
    pub ip_address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub expired: bool,
}

impl SessionRecord {
    /// Valid only while `now < last_accessed + ttl` and not expired
    pub fn is_valid_at(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        !self.expired && now < self.last_accessed + ttl
    }
}

/// Session table access
#[derive(Clone)]
pub struct SessionStore {
    db: SqlitePool,
}

impl SessionStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Create an anonymous session; returns the raw key for the cookie
    pub async fn create(
        &self,
        ip_address: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(String, SessionRecord), AuthError> {
        let key = generate_token();
        let hash = hash_session_key(&key);

        sqlx::query(
            r#"
            INSERT INTO sessions (session_hash, user_id, ip_address, created_at, last_accessed)
            VALUES (?, NULL, ?, ?, ?)
            "#,
        )
        .bind(&hash)
        .bind(ip_address)
        .bind(now)
        .bind(now)
        .execute(&self.db)
        .await?;

        let record = self
            .find(&hash)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        Ok((key, record))
    }

    pub async fn find(&self, session_hash: &str) -> Result<Option<SessionRecord>, AuthError> {
        let record = sqlx::query_as::<_, SessionRecord>(
            r#"
            SELECT id, session_hash, user_id, ip_address, created_at, last_accessed, expired
            FROM sessions
            WHERE session_hash = ?
            "#,
        )
        .bind(session_hash)
        .fetch_optional(&self.db)
        .await?;

        Ok(record)
    }

    pub async fn touch(
        &self,
        session_hash: &str,
        ip_address: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        sqlx::query(
            r#"
            UPDATE sessions
            SET last_accessed = ?, ip_address = COALESCE(?, ip_address)
            WHERE session_hash = ? AND expired = 0
            "#,
        )
        .bind(now)
        .bind(ip_address)
        .bind(session_hash)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    pub async fn bind_user(&self, session_hash: &str, user_id: Uuid) -> Result<(), AuthError> {
        sqlx::query("UPDATE sessions SET user_id = ? WHERE session_hash = ? AND expired = 0")
            .bind(user_id)
            .bind(session_hash)
            .execute(&self.db)
            .await?;

        Ok(())
    }

    /// Expiry is one-way: there is no statement that clears the flag
    pub async fn expire(&self, session_hash: &str) -> Result<(), AuthError> {
        sqlx::query("UPDATE sessions SET expired = 1 WHERE session_hash = ?")
            .bind(session_hash)
            .execute(&self.db)
            .await?;

        Ok(())
    }

    /// Delete expired rows and rows idle for `ttl` or longer
    pub async fn prune(&self, now: DateTime<Utc>, ttl: Duration) -> Result<u64, AuthError> {
        let result = sqlx::query("DELETE FROM sessions WHERE expired = 1 OR last_accessed <= ?")
            .bind(now - ttl)
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected())
    }

    #[cfg(test)]
    async fn set_last_accessed(
        &self,
        session_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        sqlx::query("UPDATE sessions SET last_accessed = ? WHERE session_hash = ?")
            .bind(at)
            .bind(session_hash)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

/// Resolves request credentials into a [`Session`]
#[derive(Clone)]
pub struct SessionGuard {
    inner: Arc<SessionGuardInner>,
}

struct SessionGuardInner {
    tokens: TokenStore,
    sessions: SessionStore,
    session_ttl: Duration,
}

impl SessionGuard {
    pub fn new(tokens: TokenStore, sessions: SessionStore, session_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(SessionGuardInner {
                tokens,
                sessions,
                session_ttl,
            }),
        }
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.inner.tokens
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.inner.sessions
    }

    pub fn session_ttl(&self) -> Duration {
        self.inner.session_ttl
    }

    pub async fn authenticate(&self, ctx: &RequestContext) -> Result<Session, AuthError> {
        self.authenticate_at(ctx, Utc::now()).await
    }

    /// Bearer tokens win over cookies. A request with neither (or with a
    /// dead cookie) gets a fresh anonymous browser session.
    pub async fn authenticate_at(
        &self,
        ctx: &RequestContext,
        now: DateTime<Utc>,
    ) -> Result<Session, AuthError> {
        if let Some(token) = &ctx.bearer_token {
            return self.authenticate_token(token, now).await;
        }

        if let Some(key) = &ctx.session_key {
            let hash = hash_session_key(key);

            if let Some(record) = self.inner.sessions.find(&hash).await? {
                if record.is_valid_at(now, self.inner.session_ttl) {
                    self.inner
                        .sessions
                        .touch(&hash, ctx.ip_address.as_deref(), now)
                        .await?;

                    return Ok(Session {
                        method: AuthMethod::SessionCookie,
                        handle: Some(hash),
                        user_id: record.user_id,
                        authenticated: record.user_id.is_some(),
                        token_expired: false,
                        new_session_key: None,
                    });
                }

                if !record.expired {
                    self.inner.sessions.expire(&hash).await?;
                    tracing::info!(session_id = record.id, "Expired stale session");
                }
            }
        }

        let (key, record) = self
            .inner
            .sessions
            .create(ctx.ip_address.as_deref(), now)
            .await?;

        Ok(Session {
            method: AuthMethod::Anonymous,
            handle: Some(record.session_hash),
            new_session_key: Some(key),
            ..Session::anonymous()
        })
    }

    async fn authenticate_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Session, AuthError> {
        let record = self.inner.tokens.find_access_token(token).await?;

        Ok(match record {
            Some(record) if now < record.expires_at => Session::for_user(record.user_id),
            Some(_) => Session {
                method: AuthMethod::AccessToken,
                token_expired: true,
                ..Session::anonymous()
            },
            None => Session {
                method: AuthMethod::AccessToken,
                ..Session::anonymous()
            },
        })
    }

    pub fn require_authenticated(&self, session: &Session) -> Result<Uuid, Unauthenticated> {
        session.require_user()
    }

    /// Bind a user to a freshly minted browser session and return its key.
    /// The key the caller arrived with is expired, authenticated or not.
    pub async fn login(
        &self,
        session: &Session,
        user_id: Uuid,
        ip_address: Option<&str>,
    ) -> Result<String, AuthError> {
        if let Some(handle) = &session.handle {
            self.inner.sessions.expire(handle).await?;
        }

        let (key, record) = self.inner.sessions.create(ip_address, Utc::now()).await?;
        self.inner.sessions.bind_user(&record.session_hash, user_id).await?;
        tracing::info!(user_id = %user_id, session_id = record.id, "Bound user to new session");

        Ok(key)
    }

    pub async fn logout(&self, session: &Session) -> Result<(), AuthError> {
        if let Some(handle) = &session.handle {
            self.inner.sessions.expire(handle).await?;
        }
        Ok(())
    }
}
