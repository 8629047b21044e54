//! Configuration management for Vessel Server

use serde::Deserialize;
use std::env;
use std::path::PathBuf;

use crate::storage::BackendKind;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub uploads: UploadConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Request body limit applied to part uploads
    pub max_part_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub access_token_ttl_secs: i64,
    pub refresh_token_ttl_secs: i64,
    /// Browser sessions go stale this long after their last access
    pub session_ttl_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    pub default_backend: BackendKind,
    pub max_upload_bytes: u64,
    pub stale_upload_secs: i64,
    pub janitor_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub local: LocalStorageConfig,
    pub s3: Option<S3Config>,
    pub azure: Option<AzureConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalStorageConfig {
    pub root: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    pub endpoint: Option<String>,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: Option<String>,
    pub prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AzureConfig {
    /// e.g. `https://account.blob.core.windows.net/backups`
    pub container_url: String,
    /// SAS query string without the leading `?`
    pub sas_token: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
                max_part_bytes: 64 * 1024 * 1024,
            },
            database: DatabaseConfig {
                url: "sqlite:./vessel.db".to_string(),
            },
            auth: AuthConfig {
                access_token_ttl_secs: 3600,
                refresh_token_ttl_secs: 30 * 24 * 3600,
                session_ttl_secs: 24 * 3600,
            },
            uploads: UploadConfig {
                default_backend: BackendKind::Local,
                max_upload_bytes: 50 * 1024 * 1024 * 1024,
                stale_upload_secs: 24 * 3600,
                janitor_interval_secs: 300,
            },
            storage: StorageConfig {
                local: LocalStorageConfig {
                    root: PathBuf::from("./data"),
                },
                s3: None,
                azure: None,
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();

        Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_var("SERVER_PORT", defaults.server.port),
                max_part_bytes: parse_var("MAX_PART_BYTES", defaults.server.max_part_bytes),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
            },
            auth: AuthConfig {
                access_token_ttl_secs: parse_var(
                    "ACCESS_TOKEN_TTL_SECS",
                    defaults.auth.access_token_ttl_secs,
                ),
                refresh_token_ttl_secs: parse_var(
                    "REFRESH_TOKEN_TTL_SECS",
                    defaults.auth.refresh_token_ttl_secs,
                ),
                session_ttl_secs: parse_var("SESSION_TTL_SECS", defaults.auth.session_ttl_secs),
            },
            uploads: UploadConfig {
                default_backend: parse_var("DEFAULT_BACKEND", defaults.uploads.default_backend),
                max_upload_bytes: parse_var("MAX_UPLOAD_BYTES", defaults.uploads.max_upload_bytes),
                stale_upload_secs: parse_var("STALE_UPLOAD_SECS", defaults.uploads.stale_upload_secs),
                janitor_interval_secs: parse_var(
                    "JANITOR_INTERVAL_SECS",
                    defaults.uploads.janitor_interval_secs,
                ),
            },
            storage: StorageConfig {
                local: LocalStorageConfig {
                    root: env::var("LOCAL_STORAGE_ROOT")
                        .map(PathBuf::from)
                        .unwrap_or(defaults.storage.local.root),
                },
                s3: s3_from_env(),
                azure: azure_from_env(),
            },
        }
    }
}

/// S3 is only enabled when a bucket and a key pair are present
fn s3_from_env() -> Option<S3Config> {
    Some(S3Config {
        endpoint: env::var("S3_ENDPOINT").ok(),
        bucket: env::var("S3_BUCKET").ok()?,
        access_key: env::var("S3_ACCESS_KEY").ok()?,
        secret_key: env::var("S3_SECRET_KEY").ok()?,
        region: env::var("S3_REGION").ok(),
        prefix: env::var("S3_PREFIX").unwrap_or_else(|_| "uploads".to_string()),
    })
}

fn azure_from_env() -> Option<AzureConfig> {
    Some(AzureConfig {
        container_url: env::var("AZURE_CONTAINER_URL").ok()?,
        sas_token: env::var("AZURE_SAS_TOKEN")
            .ok()?
            .trim_start_matches('?')
            .to_string(),
    })
}

/// Unset variables take the default; unparseable ones too, with a warning
fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(var = name, value = %raw, "Failed to parse config value, using default");
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_session_rule() {
        let config = Config::default();
        assert_eq!(config.auth.session_ttl_secs, 86_400);
        assert_eq!(config.uploads.default_backend, BackendKind::Local);
        assert!(config.storage.s3.is_none());
    }

    #[test]
    fn test_parse_var_falls_back_on_garbage() {
        std::env::set_var("VESSEL_TEST_PORT", "not-a-number");
        assert_eq!(parse_var("VESSEL_TEST_PORT", 3000u16), 3000);
        std::env::set_var("VESSEL_TEST_PORT", "8080");
        assert_eq!(parse_var("VESSEL_TEST_PORT", 3000u16), 8080);
    }
}
