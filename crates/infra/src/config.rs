//! Pipeline configuration from environment variables.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `EVENTIDE_RELAY_POLL_INTERVAL_MS` | 1000 |
//! | `EVENTIDE_RELAY_BATCH_SIZE` | 100 |
//! | `EVENTIDE_RELAY_MAX_ATTEMPTS` | 5 |
//! | `EVENTIDE_RELAY_BACKOFF_BASE_MS` | 1000 |
//! | `EVENTIDE_SNAPSHOT_INTERVAL` | 10 |
//! | `EVENTIDE_CONSISTENCY_THRESHOLD_MS` | 5000 |
//! | `USE_PERSISTENT_STORES` | false |
//! | `DATABASE_URL` | required when persistent |

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::outbox::OutboxRelayConfig;
use crate::projections::DEFAULT_LAG_THRESHOLD_MS;
use crate::snapshot::{DEFAULT_SNAPSHOT_INTERVAL, SnapshotPolicy};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("{0} must be set when USE_PERSISTENT_STORES=true")]
    Missing(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub relay_poll_interval: Duration,
    pub relay_batch_size: usize,
    pub relay_max_attempts: u32,
    pub relay_backoff_base: Duration,
    pub snapshot_interval: u64,
    pub consistency_threshold_ms: u64,
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let relay = OutboxRelayConfig::default();
        Self {
            relay_poll_interval: relay.poll_interval,
            relay_batch_size: relay.batch_size,
            relay_max_attempts: relay.max_attempts,
            relay_backoff_base: relay.backoff_base,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            consistency_threshold_ms: DEFAULT_LAG_THRESHOLD_MS,
            use_persistent_stores: false,
            database_url: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset keys take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let poll_ms = parse(&lookup, "EVENTIDE_RELAY_POLL_INTERVAL_MS")?
            .unwrap_or(defaults.relay_poll_interval.as_millis() as u64);
        let batch_size = parse(&lookup, "EVENTIDE_RELAY_BATCH_SIZE")?
            .unwrap_or(defaults.relay_batch_size);
        let max_attempts = parse(&lookup, "EVENTIDE_RELAY_MAX_ATTEMPTS")?
            .unwrap_or(defaults.relay_max_attempts);
        let backoff_ms = parse(&lookup, "EVENTIDE_RELAY_BACKOFF_BASE_MS")?
            .unwrap_or(defaults.relay_backoff_base.as_millis() as u64);
        let snapshot_interval = parse(&lookup, "EVENTIDE_SNAPSHOT_INTERVAL")?
            .unwrap_or(defaults.snapshot_interval);
        let consistency_threshold_ms = parse(&lookup, "EVENTIDE_CONSISTENCY_THRESHOLD_MS")?
            .unwrap_or(defaults.consistency_threshold_ms);
        let use_persistent_stores = parse(&lookup, "USE_PERSISTENT_STORES")?
            .unwrap_or(defaults.use_persistent_stores);
        let database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());

        non_zero("EVENTIDE_RELAY_POLL_INTERVAL_MS", poll_ms)?;
        non_zero("EVENTIDE_RELAY_BATCH_SIZE", batch_size as u64)?;
        non_zero("EVENTIDE_SNAPSHOT_INTERVAL", snapshot_interval)?;

        if use_persistent_stores && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        Ok(Self {
            relay_poll_interval: Duration::from_millis(poll_ms),
            relay_batch_size: batch_size,
            relay_max_attempts: max_attempts,
            relay_backoff_base: Duration::from_millis(backoff_ms),
            snapshot_interval,
            consistency_threshold_ms,
            use_persistent_stores,
            database_url,
        })
    }

    pub fn relay_config(&self) -> OutboxRelayConfig {
        OutboxRelayConfig::default()
            .with_poll_interval(self.relay_poll_interval)
            .with_batch_size(self.relay_batch_size)
            .with_max_attempts(self.relay_max_attempts)
            .with_backoff_base(self.relay_backoff_base)
    }

    pub fn snapshot_policy(&self) -> SnapshotPolicy {
        SnapshotPolicy::every(self.snapshot_interval)
    }
}

fn parse<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                key,
                reason: format!("'{raw}': {e}"),
            }),
    }
}

fn non_zero(key: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}
