use std::{env, path::PathBuf};

use crate::store::PageLimits;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },

    #[error("{0} must be set")]
    Missing(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Session tokens are looked up in the `auth_sessions` table.
    Database,
    /// Session tokens are validated by a remote auth server.
    Remote,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub store_backend: StoreBackend,
    pub database_url: String,
    pub max_connections: u32,
    /// JSON seed for the memory backend.
    pub memory_seed: Option<PathBuf>,
    pub auth_mode: AuthMode,
    pub auth_remote_url: Option<String>,
    pub auth_remote_api_key: Option<String>,
    pub page_limits: PageLimits,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let port = parse_or(&get, "PORT", 4000u16)?;
        let store_backend = match get("STORE_BACKEND").as_deref() {
            None | Some("postgres") => StoreBackend::Postgres,
            Some("memory") => StoreBackend::Memory,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "STORE_BACKEND",
                    value: other.to_string(),
                })
            }
        };
        let auth_mode = match get("AUTH_MODE").as_deref() {
            None | Some("database") => AuthMode::Database,
            Some("remote") => AuthMode::Remote,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "AUTH_MODE",
                    value: other.to_string(),
                })
            }
        };
        let auth_remote_url = get("AUTH_REMOTE_URL");
        if auth_mode == AuthMode::Remote && auth_remote_url.is_none() {
            return Err(ConfigError::Missing("AUTH_REMOTE_URL"));
        }

        let page_limits = PageLimits {
            default: parse_or(&get, "PAGE_SIZE_DEFAULT", PageLimits::default().default)?,
            max: parse_or(&get, "PAGE_SIZE_MAX", PageLimits::default().max)?,
        };
        if page_limits.default <= 0 || page_limits.max < page_limits.default {
            return Err(ConfigError::Invalid {
                key: "PAGE_SIZE_DEFAULT",
                value: format!("{} (max {})", page_limits.default, page_limits.max),
            });
        }

        Ok(Self {
            port,
            store_backend,
            database_url: resolve_database_url(&get),
            max_connections: parse_or(&get, "DATABASE_MAX_CONNECTIONS", 10u32)?,
            memory_seed: get("MEMORY_SEED").map(PathBuf::from),
            auth_mode,
            auth_remote_url,
            auth_remote_api_key: get("AUTH_REMOTE_API_KEY"),
            page_limits,
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(key) {
        None => Ok(default),
        Some(value) => value
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

fn resolve_database_url(get: &impl Fn(&str) -> Option<String>) -> String {
    if let Some(url) = get("DATABASE_URL") {
        return url;
    }
    let pick = |primary: &str, fallback: &str, default: &str| {
        get(primary)
            .or_else(|| get(fallback))
            .unwrap_or_else(|| default.to_string())
    };
    let host = pick("POSTGRES_HOST", "PGHOST", "localhost");
    let port = pick("POSTGRES_PORT", "PGPORT", "5432");
    let user = pick("POSTGRES_USER", "PGUSER", "postgres");
    let password = pick("POSTGRES_PASSWORD", "PGPASSWORD", "postgres");
    let db = pick("POSTGRES_DB", "PGDATABASE", "support_chat");
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}
