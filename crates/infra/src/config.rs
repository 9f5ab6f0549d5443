//! Datastore configuration.
//!
//! Read from the environment, with defaults for everything except the URL:
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `DATABASE_URL` | (required) | Postgres connection string |
//! | `JOBS_DB_MAX_CONNECTIONS` | `5` | Pool size |
//! | `JOBS_DB_ACQUIRE_TIMEOUT_SECS` | `5` | How long to wait for a pooled connection |
//! | `JOBS_CLOCK_SOURCE` | `application` | `application` or `database` |

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;

use crate::jobs::ClockSource;

pub const DATABASE_URL: &str = "DATABASE_URL";
pub const MAX_CONNECTIONS: &str = "JOBS_DB_MAX_CONNECTIONS";
pub const ACQUIRE_TIMEOUT_SECS: &str = "JOBS_DB_ACQUIRE_TIMEOUT_SECS";
pub const CLOCK_SOURCE: &str = "JOBS_CLOCK_SOURCE";

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Connection settings for the shared job table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub clock_source: ClockSource,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(5),
            clock_source: ClockSource::Application,
        }
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_clock_source(mut self, clock_source: ClockSource) -> Self {
        self.clock_source = clock_source;
        self
    }

    /// Load from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load using an arbitrary variable lookup (tests pass a map here).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = lookup(DATABASE_URL)
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing(DATABASE_URL))?;
        let mut config = Self::new(url);

        if let Some(raw) = lookup(MAX_CONNECTIONS) {
            config.max_connections = match raw.trim().parse::<u32>() {
                Ok(0) => return Err(invalid(MAX_CONNECTIONS, raw, "must be at least 1")),
                Ok(n) => n,
                Err(e) => return Err(invalid(MAX_CONNECTIONS, raw, e)),
            };
        }

        if let Some(raw) = lookup(ACQUIRE_TIMEOUT_SECS) {
            let secs = raw
                .trim()
                .parse::<u64>()
                .map_err(|e| invalid(ACQUIRE_TIMEOUT_SECS, raw.clone(), e))?;
            config.acquire_timeout = Duration::from_secs(secs);
        }

        if let Some(raw) = lookup(CLOCK_SOURCE) {
            config.clock_source = match raw.trim().to_ascii_lowercase().as_str() {
                "application" | "app" => ClockSource::Application,
                "database" | "db" => ClockSource::Database,
                _ => {
                    return Err(invalid(
                        CLOCK_SOURCE,
                        raw,
                        "expected `application` or `database`",
                    ));
                }
            };
        }

        Ok(config)
    }

    /// Open a connection pool with these settings.
    pub async fn connect(&self) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .connect(&self.url)
            .await
    }
}

fn invalid(var: &'static str, value: String, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        var,
        value,
        reason: reason.to_string(),
    }
}
