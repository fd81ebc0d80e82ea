//! Engine configuration
//!
//! Defaults are compiled in; an optional JSON file and then `CDC_AGG_*`
//! environment variables override them. `validate()` runs last.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use types::aggregate::BucketWidth;

use crate::retry::RetryPolicy;

/// Prefix of environment variables that override config fields.
pub const ENV_PREFIX: &str = "CDC_AGG_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Tunables of the aggregation engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Time trigger for sealing a batch.
    pub batch_window_seconds: u64,
    /// Size trigger for sealing a batch, in observed events.
    pub max_batch_size: usize,
    /// Events stamped further than this in the future are rejected.
    pub max_event_skew_seconds: i64,
    /// Events older than this are rejected. Unbounded when unset.
    pub max_event_age_seconds: Option<i64>,
    pub aggregate_time_bucket_width_seconds: i64,
    /// Retries after the first apply attempt before a batch goes DEAD.
    pub max_retry_count: u32,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    /// Fractional jitter applied to each backoff delay (0.0-1.0).
    pub retry_jitter: f64,
    pub key_partition_count: u32,
    /// Transactions remembered per partition for UPDATE compensation.
    pub recent_state_capacity: usize,
    /// Bound of each partition's input channel.
    pub partition_channel_capacity: usize,
    /// Attempts per processing log append.
    pub log_write_attempts: u32,
    /// Snapshots kept per partition by the durable store.
    pub snapshot_retention: usize,
    pub snapshot_compression: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_window_seconds: 30,
            max_batch_size: 10_000,
            max_event_skew_seconds: 3_600,
            max_event_age_seconds: None,
            aggregate_time_bucket_width_seconds: 3_600,
            max_retry_count: 5,
            retry_initial_backoff_ms: 100,
            retry_max_backoff_ms: 10_000,
            retry_jitter: 0.1,
            key_partition_count: 4,
            recent_state_capacity: 100_000,
            partition_channel_capacity: 10_000,
            log_write_attempts: 3,
            snapshot_retention: 3,
            snapshot_compression: true,
        }
    }
}

impl EngineConfig {
    /// Defaults, overridden by `path` (if given) and then by the process
    /// environment, then validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON config file. Missing fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Apply `CDC_AGG_<FIELD>` overrides from the given variables.
    /// Unrelated variables and unknown `CDC_AGG_` keys are ignored.
    pub fn apply_env_overrides<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(field) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let field = field.to_ascii_lowercase();
            let invalid = || ConfigError::InvalidEnv {
                key: key.clone(),
                value: value.clone(),
            };
            let v = value.trim();
            match field.as_str() {
                "batch_window_seconds" => self.batch_window_seconds = v.parse().map_err(|_| invalid())?,
                "max_batch_size" => self.max_batch_size = v.parse().map_err(|_| invalid())?,
                "max_event_skew_seconds" => self.max_event_skew_seconds = v.parse().map_err(|_| invalid())?,
                "max_event_age_seconds" => {
                    self.max_event_age_seconds = if v.is_empty() {
                        None
                    } else {
                        Some(v.parse().map_err(|_| invalid())?)
                    }
                }
                "aggregate_time_bucket_width_seconds" => {
                    self.aggregate_time_bucket_width_seconds = v.parse().map_err(|_| invalid())?
                }
                "max_retry_count" => self.max_retry_count = v.parse().map_err(|_| invalid())?,
                "retry_initial_backoff_ms" => self.retry_initial_backoff_ms = v.parse().map_err(|_| invalid())?,
                "retry_max_backoff_ms" => self.retry_max_backoff_ms = v.parse().map_err(|_| invalid())?,
                "retry_jitter" => self.retry_jitter = v.parse().map_err(|_| invalid())?,
                "key_partition_count" => self.key_partition_count = v.parse().map_err(|_| invalid())?,
                "recent_state_capacity" => self.recent_state_capacity = v.parse().map_err(|_| invalid())?,
                "partition_channel_capacity" => {
                    self.partition_channel_capacity = v.parse().map_err(|_| invalid())?
                }
                "log_write_attempts" => self.log_write_attempts = v.parse().map_err(|_| invalid())?,
                "snapshot_retention" => self.snapshot_retention = v.parse().map_err(|_| invalid())?,
                "snapshot_compression" => self.snapshot_compression = v.parse().map_err(|_| invalid())?,
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key_partition_count == 0 {
            return Err(ConfigError::Invalid("key_partition_count must be > 0".into()));
        }
        if self.batch_window_seconds == 0 {
            return Err(ConfigError::Invalid("batch_window_seconds must be > 0".into()));
        }
        if self.max_batch_size == 0 {
            return Err(ConfigError::Invalid("max_batch_size must be > 0".into()));
        }
        if BucketWidth::from_secs(self.aggregate_time_bucket_width_seconds).is_none() {
            return Err(ConfigError::Invalid(
                "aggregate_time_bucket_width_seconds must be > 0".into(),
            ));
        }
        if self.max_event_skew_seconds < 0 {
            return Err(ConfigError::Invalid("max_event_skew_seconds must be >= 0".into()));
        }
        if matches!(self.max_event_age_seconds, Some(age) if age <= 0) {
            return Err(ConfigError::Invalid("max_event_age_seconds must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err(ConfigError::Invalid("retry_jitter must be within 0.0..=1.0".into()));
        }
        if self.retry_initial_backoff_ms > self.retry_max_backoff_ms {
            return Err(ConfigError::Invalid(
                "retry_initial_backoff_ms must not exceed retry_max_backoff_ms".into(),
            ));
        }
        if self.partition_channel_capacity == 0 {
            return Err(ConfigError::Invalid("partition_channel_capacity must be > 0".into()));
        }
        if self.log_write_attempts == 0 {
            return Err(ConfigError::Invalid("log_write_attempts must be > 0".into()));
        }
        Ok(())
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_secs(self.batch_window_seconds)
    }

    pub fn bucket_width(&self) -> BucketWidth {
        BucketWidth::from_secs(self.aggregate_time_bucket_width_seconds).unwrap_or_default()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential()
            .with_max_retries(self.max_retry_count)
            .with_initial_interval(Duration::from_millis(self.retry_initial_backoff_ms))
            .with_max_interval(Duration::from_millis(self.retry_max_backoff_ms))
            .with_jitter(self.retry_jitter)
    }
}
