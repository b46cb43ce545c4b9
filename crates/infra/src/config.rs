//! Configuration loading and representation.
//!
//! Settings come from environment variables. Parsing goes through a lookup
//! function so callers (and tests) can supply any source.
//!
//! | Variable | Default | Meaning |
//! |---|---|---|
//! | `JOBFORGE_STORE` | `memory` | `memory`, `postgres` or `redis` |
//! | `DATABASE_URL` | required for `postgres` | Postgres connection URL |
//! | `JOBFORGE_PG_MAX_CONNECTIONS` | `10` | Postgres pool size |
//! | `REDIS_URL` | `redis://localhost:6379` | Redis connection URL |
//! | `JOBFORGE_KEY_PREFIX` | `jobforge` | Redis key prefix |
//! | `JOBFORGE_WORKERS` | `4` | worker threads |
//! | `JOBFORGE_BATCH_SIZE` | `16` | candidates per claim attempt |
//! | `JOBFORGE_POLL_INTERVAL_MS` | `200` | idle backoff |
//! | `JOBFORGE_STALE_TIMEOUT_SECS` | unset | enables the reaper |
//! | `JOBFORGE_POOL_NAME` | `jobforge` | pool name for logs and threads |

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::jobs::WorkerPoolConfig;

/// Configuration error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be set")]
    Missing { name: &'static str },

    #[error("{name} has invalid value '{value}': {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Which store adapter to run against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Postgres { url: String, max_connections: u32 },
    Redis { url: String, prefix: String },
}

impl StoreBackend {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreBackend::Memory => "memory",
            StoreBackend::Postgres { .. } => "postgres",
            StoreBackend::Redis { .. } => "redis",
        }
    }
}

/// Worker process settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub store: StoreBackend,
    pub workers: usize,
    pub pool_name: String,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub stale_timeout: Option<Duration>,
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read settings through `lookup`, which returns a variable's value if set.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let store = match lookup("JOBFORGE_STORE").as_deref().unwrap_or("memory") {
            "memory" => StoreBackend::Memory,
            "postgres" => StoreBackend::Postgres {
                url: lookup("DATABASE_URL").ok_or(ConfigError::Missing {
                    name: "DATABASE_URL",
                })?,
                max_connections: parse_or(&lookup, "JOBFORGE_PG_MAX_CONNECTIONS", 10)?,
            },
            "redis" => StoreBackend::Redis {
                url: lookup("REDIS_URL").unwrap_or_else(|| "redis://localhost:6379".to_string()),
                prefix: lookup("JOBFORGE_KEY_PREFIX").unwrap_or_else(|| "jobforge".to_string()),
            },
            other => {
                return Err(ConfigError::Invalid {
                    name: "JOBFORGE_STORE",
                    value: other.to_string(),
                    reason: "expected memory, postgres or redis".to_string(),
                });
            }
        };

        let workers: usize = parse_or(&lookup, "JOBFORGE_WORKERS", 4)?;
        if workers == 0 {
            return Err(ConfigError::Invalid {
                name: "JOBFORGE_WORKERS",
                value: "0".to_string(),
                reason: "at least one worker is required".to_string(),
            });
        }

        Ok(Self {
            store,
            workers,
            pool_name: lookup("JOBFORGE_POOL_NAME").unwrap_or_else(|| "jobforge".to_string()),
            batch_size: parse_or(&lookup, "JOBFORGE_BATCH_SIZE", 16)?,
            poll_interval: Duration::from_millis(parse_or(&lookup, "JOBFORGE_POLL_INTERVAL_MS", 200)?),
            stale_timeout: parse_opt::<u64, _>(&lookup, "JOBFORGE_STALE_TIMEOUT_SECS")?
                .map(Duration::from_secs),
        })
    }

    /// Pool configuration derived from these settings.
    pub fn pool_config(&self) -> WorkerPoolConfig {
        let config = WorkerPoolConfig::default()
            .with_name(self.pool_name.clone())
            .with_batch_size(self.batch_size)
            .with_poll_interval(self.poll_interval);
        match self.stale_timeout {
            // Sweep a few times per timeout window.
            Some(timeout) => config
                .with_stale_timeout(timeout)
                .with_reaper_interval((timeout / 4).max(Duration::from_secs(1))),
            None => config,
        }
    }
}

fn parse_opt<T, F>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|value| {
            value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                name,
                value: value.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn parse_or<T, F>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_opt(lookup, name)?.unwrap_or(default))
}
