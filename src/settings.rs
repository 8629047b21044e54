//! Client settings
//!
//! Defaults live in `client_settings`; a user may override any of them in
//! `user_settings`. Values are stored as text and typed on the way out.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettingValue {
    pub value: Value,
    #[serde(rename = "type")]
    pub data_type: String,
    pub user_override: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct SettingRow {
    name: String,
    value: String,
    data_type: String,
    override_value: Option<String>,
}

/// Typed JSON for a stored value; unparseable numbers stay strings
fn typed_value(raw: &str, data_type: &str) -> Value {
    match data_type {
        "int" => raw
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(raw)),
        "bool" => match raw.trim() {
            "1" | "true" => Value::Bool(true),
            "0" | "false" => Value::Bool(false),
            _ => Value::from(raw),
        },
        _ => Value::from(raw),
    }
}

#[derive(Clone)]
pub struct SettingsStore {
    db: SqlitePool,
}

impl SettingsStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// All settings as seen by `user_id`
    pub async fn for_user(
        &self,
        user_id: Uuid,
    ) -> Result<BTreeMap<String, SettingValue>, sqlx::Error> {
        let rows = sqlx::query_as::<_, SettingRow>(
            r#"
            SELECT c.name, c.value, c.data_type, u.value AS override_value
            FROM client_settings AS c
            LEFT JOIN user_settings AS u
                ON c.setting_id = u.setting_id AND u.user_id = ?
            ORDER BY c.name
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let (raw, user_override) = match row.override_value {
                    Some(v) if !v.is_empty() => (v, true),
                    _ => (row.value, false),
                };
                let setting = SettingValue {
                    value: typed_value(&raw, &row.data_type),
                    data_type: row.data_type,
                    user_override,
                };
                (row.name, setting)
            })
            .collect())
    }

    pub async fn set_default(
        &self,
        name: &str,
        value: &str,
        data_type: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO client_settings (name, value, data_type)
            VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET value = excluded.value, data_type = excluded.data_type
            "#,
        )
        .bind(name)
        .bind(value)
        .bind(data_type)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// Returns false when no default named `name` exists
    pub async fn set_override(
        &self,
        user_id: Uuid,
        name: &str,
        value: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO user_settings (setting_id, user_id, value)
            SELECT setting_id, ?, ? FROM client_settings WHERE name = ?
            ON CONFLICT(setting_id, user_id) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(user_id)
        .bind(value)
        .bind(name)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
