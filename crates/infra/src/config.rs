//! Configuration loading and representation.
//!
//! | Variable                      | Default   |
//! |-------------------------------|-----------|
//! | `DATABASE_URL`                | required  |
//! | `DB_MAX_CONNECTIONS`          | 10        |
//! | `DB_MIN_CONNECTIONS`          | 1         |
//! | `DB_ACQUIRE_TIMEOUT_MS`       | 5000      |
//! | `CONSUMER_BATCH_SIZE`         | 100       |
//! | `CONSUMER_POLL_INTERVAL_MS`   | 100       |
//! | `IDEMPOTENCY_RETENTION_HOURS` | 24        |
//! | `READ_INFRA_AGGREGATE_TYPES`  | `node`    |

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use eventlog_core::AggregateType;

use crate::consumer::ConsumerConfig;
use crate::event_store::{MAX_READ_LIMIT, ReadPolicy};
use crate::idempotency::MIN_RETENTION;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct EventLogConfig {
    pub db: DbConfig,
    pub consumer: ConsumerConfig,
    /// Clamped to at least 24 hours.
    pub idempotency_retention: Duration,
    pub read_policy: ReadPolicy,
}

impl EventLogConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = lookup("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let max_connections: u32 = parse_or(&lookup, "DB_MAX_CONNECTIONS", 10)?;
        let min_connections: u32 = parse_or(&lookup, "DB_MIN_CONNECTIONS", 1)?;
        if max_connections == 0 || min_connections > max_connections {
            return Err(ConfigError::Invalid {
                name: "DB_MIN_CONNECTIONS",
                reason: format!("need 0 <= min ({min_connections}) <= max ({max_connections}) and max > 0"),
            });
        }
        let acquire_timeout = Duration::from_millis(parse_or(&lookup, "DB_ACQUIRE_TIMEOUT_MS", 5_000)?);

        let batch_size: usize = parse_or(&lookup, "CONSUMER_BATCH_SIZE", 100)?;
        if batch_size == 0 || batch_size > MAX_READ_LIMIT {
            return Err(ConfigError::Invalid {
                name: "CONSUMER_BATCH_SIZE",
                reason: format!("must be 1..={MAX_READ_LIMIT}"),
            });
        }
        let poll_interval = Duration::from_millis(parse_or(&lookup, "CONSUMER_POLL_INTERVAL_MS", 100)?);

        let retention_hours: u64 = parse_or(&lookup, "IDEMPOTENCY_RETENTION_HOURS", 24)?;
        let idempotency_retention = Duration::from_secs(retention_hours.saturating_mul(3600)).max(MIN_RETENTION);

        let read_policy = match lookup("READ_INFRA_AGGREGATE_TYPES") {
            None => ReadPolicy::default(),
            Some(raw) => {
                let types = raw
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(AggregateType::new)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| ConfigError::Invalid {
                        name: "READ_INFRA_AGGREGATE_TYPES",
                        reason: e.to_string(),
                    })?;
                ReadPolicy::new(types)
            }
        };

        Ok(Self {
            db: DbConfig {
                database_url,
                max_connections,
                min_connections,
                acquire_timeout,
            },
            consumer: ConsumerConfig {
                batch_size,
                poll_interval,
                ..ConsumerConfig::default()
            },
            idempotency_retention,
            read_policy,
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
    }
}
