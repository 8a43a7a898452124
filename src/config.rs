//! Server configuration parsed from environment variables.

use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_CLIENT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
}

impl crate::frame::ErrorCode for ConfigError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Missing(_) => "ConfigMissing",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub database_url: String,
    pub port: u16,
    pub db_max_connections: u32,
    /// Upper bound on gate reads before they fail as persistence errors.
    pub store_timeout: Duration,
    /// Outbound frames buffered per connection before fan-out drops.
    pub client_queue_capacity: usize,
}

impl AppConfig {
    /// Build typed config from environment variables.
    ///
    /// Required:
    /// - `DATABASE_URL`
    ///
    /// Optional (invalid values fall back to the default):
    /// - `PORT`: default 3000
    /// - `DB_MAX_CONNECTIONS`: default 5
    /// - `STORE_TIMEOUT_MS`: default 2000
    /// - `CLIENT_QUEUE_CAPACITY`: default 256
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` if `DATABASE_URL` is unset or empty.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`AppConfig::from_env`] against an arbitrary source.
    ///
    /// # Errors
    ///
    /// See [`AppConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = lookup("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let parse = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let port = parse("PORT")
            .and_then(|v| u16::try_from(v).ok())
            .unwrap_or(DEFAULT_PORT);
        let db_max_connections = parse("DB_MAX_CONNECTIONS")
            .and_then(|v| u32::try_from(v).ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS);
        let store_timeout_ms = parse("STORE_TIMEOUT_MS")
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_STORE_TIMEOUT_MS);
        let client_queue_capacity = parse("CLIENT_QUEUE_CAPACITY")
            .and_then(|v| usize::try_from(v).ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_CLIENT_QUEUE_CAPACITY);

        Ok(Self {
            database_url,
            port,
            db_max_connections,
            store_timeout: Duration::from_millis(store_timeout_ms),
            client_queue_capacity,
        })
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
