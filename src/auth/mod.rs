//! Authentication
//!
//! Two independent paths resolve a caller to a [`Session`]:
//! - backup agents present an access token (`Authorization: Bearer ...`)
//!   issued by the [`TokenStore`] and rotated through refresh tokens;
//! - browsers present a `session_key` cookie whose SHA-512 digest names a
//!   row in the session table, valid for 24 hours after its last access.

pub mod crypto;
pub mod sessions;
pub mod tokens;
pub mod users;

pub use sessions::{RequestContext, Session, SessionGuard, SessionStore, Unauthenticated};
pub use tokens::{AccessToken, RefreshToken, TokenConfig, TokenPair, TokenStore};
pub use users::{ActivationOutcome, UserDirectory};

/// Authentication error types
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Wrong, expired and already-rotated tokens all collapse into this
    #[error("The provided token is invalid")]
    InvalidToken,

    #[error("Invalid user name or password")]
    InvalidCredentials,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Password hash error: {0}")]
    PasswordHash(String),
}
