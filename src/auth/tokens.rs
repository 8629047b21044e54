//! Token Store
//!
//! Issues access/refresh token pairs and rotates them. Only SHA-256
//! digests are persisted. A user holds at most one live refresh token;
//! exchanging it replaces the stored digest in the same transaction that
//! issues the new access token, so a presented refresh token can succeed
//! at most once.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::crypto::{constant_time_eq, generate_token, hash_token};
use super::AuthError;
use crate::config::AuthConfig;
use crate::locks::KeyedLocks;

/// Compared against when a user has no refresh token, so the failure path
/// does the same work as a mismatch
const ABSENT_DIGEST: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            access_ttl: Duration::hours(1),
            refresh_ttl: Duration::days(30),
        }
    }
}

impl TokenConfig {
    pub fn from_auth_config(auth: &AuthConfig) -> Self {
        Self {
            access_ttl: Duration::seconds(auth.access_token_ttl_secs),
            refresh_ttl: Duration::seconds(auth.refresh_token_ttl_secs),
        }
    }
}

/// Short-lived bearer credential
#[derive(Clone, Serialize)]
pub struct AccessToken {
    pub token: String,
    pub user_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    fn new(user_id: Uuid, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            token: generate_token(),
            user_id,
            issued_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"[REDACTED]")
            .field("user_id", &self.user_id)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Long-lived, single-use credential exchanged for a new pair
#[derive(Clone, Serialize)]
pub struct RefreshToken {
    pub token: String,
    pub user_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RefreshToken {
    fn new(user_id: Uuid, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            token: generate_token(),
            user_id,
            issued_at: now,
            expires_at: now + ttl,
        }
    }
}

impl fmt::Debug for RefreshToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshToken")
            .field("token", &"[REDACTED]")
            .field("user_id", &self.user_id)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access: AccessToken,
    pub refresh: RefreshToken,
}

/// A persisted access token, known only by its digest
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AccessTokenRecord {
    pub user_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AccessTokenRecord {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

#[derive(Clone)]
pub struct TokenStore {
    inner: Arc<TokenStoreInner>,
}

struct TokenStoreInner {
    db: SqlitePool,
    config: TokenConfig,
    /// Serializes issue/refresh per user inside this process
    rotation_locks: KeyedLocks<Uuid>,
}

impl TokenStore {
    pub fn new(db: SqlitePool, config: TokenConfig) -> Self {
        Self {
            inner: Arc::new(TokenStoreInner {
                db,
                config,
                rotation_locks: KeyedLocks::new(),
            }),
        }
    }

    pub fn config(&self) -> &TokenConfig {
        &self.inner.config
    }

    /// Issue a new access token; the user's refresh token is untouched
    pub async fn issue_access_token(&self, user_id: Uuid) -> Result<AccessToken, AuthError> {
        let token = AccessToken::new(user_id, Utc::now(), self.inner.config.access_ttl);
        insert_access_token(&self.inner.db, &token).await?;

        tracing::debug!(user_id = %user_id, expires_at = %token.expires_at, "Issued access token");

        Ok(token)
    }

    /// Issue a refresh token, superseding any previous one for the user
    pub async fn issue_refresh_token(&self, user_id: Uuid) -> Result<RefreshToken, AuthError> {
        let _guard = self.inner.rotation_locks.lock(&user_id).await;

        let token = RefreshToken::new(user_id, Utc::now(), self.inner.config.refresh_ttl);

        sqlx::query(
            r#"
            INSERT INTO refresh_tokens (user_id, token_hash, issued_at, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                token_hash = excluded.token_hash,
                issued_at = excluded.issued_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(user_id)
        .bind(hash_token(&token.token))
        .bind(token.issued_at)
        .bind(token.expires_at)
        .execute(&self.inner.db)
        .await?;

        tracing::debug!(user_id = %user_id, "Issued refresh token");

        Ok(token)
    }

    /// Exchange a refresh token for a new access token and a new refresh
    /// token. Fails with [`AuthError::InvalidToken`] for unknown, expired
    /// and already-rotated tokens alike.
    pub async fn refresh(&self, user_id: Uuid, presented: &str) -> Result<TokenPair, AuthError> {
        let _guard = self.inner.rotation_locks.lock(&user_id).await;

        let now = Utc::now();
        let presented_hash = hash_token(presented);

        let mut tx = self.inner.db.begin().await?;

        let stored: Option<(String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT token_hash, expires_at FROM refresh_tokens WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let found = stored.is_some();
        let (stored_hash, expires_at) =
            stored.unwrap_or_else(|| (ABSENT_DIGEST.to_string(), now));
        let matches = constant_time_eq(&stored_hash, &presented_hash);

        if !(found & matches & (now < expires_at)) {
            return Err(AuthError::InvalidToken);
        }

        let refresh = RefreshToken::new(user_id, now, self.inner.config.refresh_ttl);

        // Compare-and-swap on the digest: only the holder of the current
        // token gets to replace it
        let rotated = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET token_hash = ?, issued_at = ?, expires_at = ?
            WHERE user_id = ? AND token_hash = ?
            "#,
        )
        .bind(hash_token(&refresh.token))
        .bind(refresh.issued_at)
        .bind(refresh.expires_at)
        .bind(user_id)
        .bind(&presented_hash)
        .execute(&mut *tx)
        .await?;

        if rotated.rows_affected() != 1 {
            return Err(AuthError::InvalidToken);
        }

        let access = AccessToken::new(user_id, now, self.inner.config.access_ttl);
        insert_access_token(&mut *tx, &access).await?;

        tx.commit().await?;

        tracing::info!(user_id = %user_id, "Rotated refresh token");

        Ok(TokenPair { access, refresh })
    }

    /// Look up an access token by value
    pub async fn find_access_token(
        &self,
        token: &str,
    ) -> Result<Option<AccessTokenRecord>, AuthError> {
        let record = sqlx::query_as::<_, AccessTokenRecord>(
            "SELECT user_id, issued_at, expires_at FROM access_tokens WHERE token_hash = ?",
        )
        .bind(hash_token(token))
        .fetch_optional(&self.inner.db)
        .await?;

        Ok(record)
    }

    /// Unknown tokens count as expired
    pub async fn is_expired(&self, token: &str) -> Result<bool, AuthError> {
        Ok(self
            .find_access_token(token)
            .await?
            .map(|record| record.is_expired())
            .unwrap_or(true))
    }

    /// Drop access tokens that expired before `before`
    pub async fn prune_expired(&self, before: DateTime<Utc>) -> Result<u64, AuthError> {
        let result = sqlx::query("DELETE FROM access_tokens WHERE expires_at < ?")
            .bind(before)
            .execute(&self.inner.db)
            .await?;

        Ok(result.rows_affected())
    }
}

async fn insert_access_token<'e, E>(executor: E, token: &AccessToken) -> Result<(), AuthError>
where
    E: sqlx::SqliteExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO access_tokens (token_hash, user_id, issued_at, expires_at)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(hash_token(&token.token))
    .bind(token.user_id)
    .bind(token.issued_at)
    .bind(token.expires_at)
    .execute(executor)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn store_with(config: TokenConfig) -> TokenStore {
        let pool = db::create_pool("sqlite::memory:").await.unwrap();
        TokenStore::new(pool, config)
    }

    async fn store() -> TokenStore {
        store_with(TokenConfig::default()).await
    }

    #[tokio::test]
    async fn test_issue_access_token() {
        let store = store().await;
        let user_id = Uuid::new_v4();

        let token = store.issue_access_token(user_id).await.unwrap();
        assert!(!token.is_expired());
        assert_eq!(token.expires_at - token.issued_at, Duration::hours(1));

        let record = store.find_access_token(&token.token).await.unwrap().unwrap();
        assert_eq!(record.user_id, user_id);
        assert!(!store.is_expired(&token.token).await.unwrap());
        assert!(store.is_expired("never-issued").await.unwrap());
    }

    #[tokio::test]
    async fn test_refresh_rotates_token() {
        let store = store().await;
        let user_id = Uuid::new_v4();
        let original = store.issue_refresh_token(user_id).await.unwrap();

        let pair = store.refresh(user_id, &original.token).await.unwrap();
        assert_eq!(pair.access.user_id, user_id);
        assert_ne!(pair.refresh.token, original.token);

        // The consumed token is dead, its replacement works
        let reuse = store.refresh(user_id, &original.token).await;
        assert!(matches!(reuse, Err(AuthError::InvalidToken)));

        let next = store.refresh(user_id, &pair.refresh.token).await;
        assert!(next.is_ok());
    }

    #[tokio::test]
    async fn test_issue_refresh_supersedes_previous() {
        let store = store().await;
        let user_id = Uuid::new_v4();

        let first = store.issue_refresh_token(user_id).await.unwrap();
        let second = store.issue_refresh_token(user_id).await.unwrap();

        assert!(matches!(
            store.refresh(user_id, &first.token).await,
            Err(AuthError::InvalidToken)
        ));
        assert!(store.refresh(user_id, &second.token).await.is_ok());
    }

    #[tokio::test]
    async fn test_refresh_failures_are_indistinguishable() {
        let store = store_with(TokenConfig {
            access_ttl: Duration::hours(1),
            refresh_ttl: Duration::seconds(-1),
        })
        .await;
        let user_id = Uuid::new_v4();
        let expired = store.issue_refresh_token(user_id).await.unwrap();

        let expired_err = store.refresh(user_id, &expired.token).await.unwrap_err();
        let wrong_err = store.refresh(user_id, "not-a-token").await.unwrap_err();
        let unknown_user_err = store
            .refresh(Uuid::new_v4(), &expired.token)
            .await
            .unwrap_err();

        assert_eq!(expired_err.to_string(), wrong_err.to_string());
        assert_eq!(wrong_err.to_string(), unknown_user_err.to_string());
    }

    #[tokio::test]
    async fn test_token_bound_to_its_user() {
        let store = store().await;
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let token = store.issue_refresh_token(alice).await.unwrap();
        store.issue_refresh_token(bob).await.unwrap();

        assert!(matches!(
            store.refresh(bob, &token.token).await,
            Err(AuthError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_refresh_single_winner() {
        let store = store().await;
        let user_id = Uuid::new_v4();
        let token = store.issue_refresh_token(user_id).await.unwrap();

        let attempts = (0..10).map(|_| {
            let store = store.clone();
            let presented = token.token.clone();
            tokio::spawn(async move { store.refresh(user_id, &presented).await })
        });

        let results = futures::future::join_all(attempts).await;
        let successes = results
            .iter()
            .filter(|r| matches!(r, Ok(Ok(_))))
            .count();
        let invalid = results
            .iter()
            .filter(|r| matches!(r, Ok(Err(AuthError::InvalidToken))))
            .count();

        assert_eq!(successes, 1);
        assert_eq!(invalid, 9);
    }

    #[tokio::test]
    async fn test_prune_expired() {
        let store = store_with(TokenConfig {
            access_ttl: Duration::seconds(-10),
            refresh_ttl: Duration::days(1),
        })
        .await;
        let token = store.issue_access_token(Uuid::new_v4()).await.unwrap();
        assert!(token.is_expired());

        let pruned = store.prune_expired(Utc::now()).await.unwrap();
        assert_eq!(pruned, 1);
        assert!(store.find_access_token(&token.token).await.unwrap().is_none());
    }
}
