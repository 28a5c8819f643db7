//! Pool configuration.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::pool::PoolOptions;
use sqlx::postgres::PgPool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use sqlx::{Database, Postgres, Sqlite};

use super::error::{SourceError, SourceResult};

const ENV_URL: &str = "MTXN_DATABASE_URL";
const ENV_MAX_CONNECTIONS: &str = "MTXN_MAX_CONNECTIONS";
const ENV_MIN_CONNECTIONS: &str = "MTXN_MIN_CONNECTIONS";
const ENV_ACQUIRE_TIMEOUT: &str = "MTXN_ACQUIRE_TIMEOUT_SECS";

/// Connection pool options.
///
/// The acquire timeout belongs to the pool. Contexts add no deadline of their
/// own, so a caller that abandons a unit of work on timeout must still roll
/// back the contexts it initialised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Database URL (`sqlite://...` or `postgres://...`).
    pub url: String,
    /// Upper bound on open connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Connections kept open while idle.
    #[serde(default)]
    pub min_connections: u32,
    /// How long `acquire` waits for a free connection.
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    5
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

impl PoolConfig {
    /// Create a configuration with default limits.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: default_max_connections(),
            min_connections: 0,
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }

    /// Read the configuration from `MTXN_*` environment variables.
    pub fn from_env() -> SourceResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from any key lookup.
    pub fn from_lookup<F>(lookup: F) -> SourceResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = lookup(ENV_URL)
            .ok_or_else(|| SourceError::Config(format!("{ENV_URL} is not set")))?;

        let mut config = Self::new(url);
        if let Some(max) = parse_var(&lookup, ENV_MAX_CONNECTIONS)? {
            config.max_connections = max;
        }
        if let Some(min) = parse_var(&lookup, ENV_MIN_CONNECTIONS)? {
            config.min_connections = min;
        }
        if let Some(secs) = parse_var(&lookup, ENV_ACQUIRE_TIMEOUT)? {
            config.acquire_timeout_secs = secs;
        }

        config.validate()?;
        Ok(config)
    }

    /// Set max_connections.
    pub fn max_connections(mut self, value: u32) -> Self {
        self.max_connections = value;
        self
    }

    /// Set min_connections.
    pub fn min_connections(mut self, value: u32) -> Self {
        self.min_connections = value;
        self
    }

    /// Set acquire_timeout_secs.
    pub fn acquire_timeout_secs(mut self, value: u64) -> Self {
        self.acquire_timeout_secs = value;
        self
    }

    /// Check the limits are coherent.
    pub fn validate(&self) -> SourceResult<()> {
        if self.url.trim().is_empty() {
            return Err(SourceError::Config("database url is empty".into()));
        }
        if self.max_connections == 0 {
            return Err(SourceError::Config("max_connections must be at least 1".into()));
        }
        if self.min_connections > self.max_connections {
            return Err(SourceError::Config(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }

    /// Open a SQLite pool, creating the database file if needed.
    pub async fn connect_sqlite(&self) -> SourceResult<SqlitePool> {
        self.validate()?;
        let options = SqliteConnectOptions::from_str(&self.url)?.create_if_missing(true);
        Ok(self.pool_options::<Sqlite>().connect_with(options).await?)
    }

    /// Open a PostgreSQL pool.
    pub async fn connect_postgres(&self) -> SourceResult<PgPool> {
        self.validate()?;
        Ok(self.pool_options::<Postgres>().connect(&self.url).await?)
    }

    fn pool_options<DB: Database>(&self) -> PoolOptions<DB> {
        PoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections)
            .acquire_timeout(Duration::from_secs(self.acquire_timeout_secs))
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> SourceResult<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| SourceError::Config(format!("{key}: {e}")))
        })
        .transpose()
}
