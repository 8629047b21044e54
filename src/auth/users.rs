//! User credential lookup and activation

use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::crypto::{constant_time_eq, hash_password, verify_password};
use super::AuthError;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRecord {
    pub id: Uuid,
    pub user_name: String,
    pub password_hash: String,
    pub activation_code: Option<String>,
    pub active: bool,
    pub activated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivationOutcome {
    pub user_id: Uuid,
    /// The user had already been activated before this call
    pub was_activated: bool,
}

#[derive(Clone)]
pub struct UserDirectory {
    db: SqlitePool,
}

impl UserDirectory {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Create a pending user awaiting activation
    pub async fn create_user(
        &self,
        user_name: &str,
        password: &str,
        activation_code: &str,
    ) -> Result<Uuid, AuthError> {
        let id = Uuid::new_v4();
        let password_hash = hash_password(password)?;

        sqlx::query(
            r#"
            INSERT INTO users (id, user_name, password_hash, activation_code, active, activated, created_at)
            VALUES (?, ?, ?, ?, 1, 0, ?)
            "#,
        )
        .bind(id)
        .bind(user_name)
        .bind(password_hash)
        .bind(activation_code)
        .bind(Utc::now())
        .execute(&self.db)
        .await?;

        tracing::info!(user_id = %id, user_name = %user_name, "Created user");

        Ok(id)
    }

    pub async fn find_by_name(&self, user_name: &str) -> Result<Option<UserRecord>, AuthError> {
        let user = sqlx::query_as::<_, UserRecord>(
            r#"
            SELECT id, user_name, password_hash, activation_code, active, activated
            FROM users
            WHERE user_name = ?
            "#,
        )
        .bind(user_name)
        .fetch_optional(&self.db)
        .await?;

        Ok(user)
    }

    pub async fn exists(&self, user_id: Uuid) -> Result<bool, AuthError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.db)
            .await?;

        Ok(row.is_some())
    }

    /// Check a password for an active, activated user
    pub async fn verify_credentials(
        &self,
        user_name: &str,
        password: &str,
    ) -> Result<Uuid, AuthError> {
        let user = self
            .find_by_name(user_name)
            .await?
            .filter(|u| u.active && u.activated)
            .ok_or(AuthError::InvalidCredentials)?;

        if !verify_password(password, &user.password_hash)? {
            return Err(AuthError::InvalidCredentials);
        }

        sqlx::query("UPDATE users SET last_login = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(user.id)
            .execute(&self.db)
            .await?;

        Ok(user.id)
    }

    /// Activate a user by name and activation code. Activating twice is
    /// allowed and reported through [`ActivationOutcome::was_activated`].
    pub async fn activate(
        &self,
        user_name: &str,
        activation_code: &str,
    ) -> Result<ActivationOutcome, AuthError> {
        let user = self
            .find_by_name(user_name)
            .await?
            .filter(|u| u.active)
            .ok_or(AuthError::InvalidCredentials)?;

        let code_matches = user
            .activation_code
            .as_deref()
            .map(|code| constant_time_eq(code, activation_code))
            .unwrap_or(false);
        if !code_matches {
            return Err(AuthError::InvalidCredentials);
        }

        if !user.activated {
            sqlx::query("UPDATE users SET activated = 1, last_login = ? WHERE id = ?")
                .bind(Utc::now())
                .bind(user.id)
                .execute(&self.db)
                .await?;

            tracing::info!(user_id = %user.id, "Activated user");
        }

        Ok(ActivationOutcome {
            user_id: user.id,
            was_activated: user.activated,
        })
    }
}
