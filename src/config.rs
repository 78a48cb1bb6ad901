//! Operational configuration.
//!
//! Defaults reproduce the usual production setup: four workers, an
//! exactly-once checkpoint every minute kept in memory, and up to
//! three restarts per ten minutes with ten seconds between them.
//!
//! Configuration can be deserialized from JSON or read from
//! `STATEFLOW_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{config_err, EngineError, EngineResult};
use crate::recovery::model::CheckpointMode;

/// Prefix of every environment variable read by
/// [`EngineConfig::from_env`].
pub const ENV_PREFIX: &str = "STATEFLOW_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Number of workers keys are spread over.
    pub parallelism: usize,
    pub checkpoint: CheckpointConfig,
    pub restart: RestartConfig,
    pub storage: StorageTarget,
    /// Capacity of each worker's record channel. The router waits when
    /// a worker falls this far behind.
    pub channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            checkpoint: CheckpointConfig::default(),
            restart: RestartConfig::default(),
            storage: StorageTarget::InMemory,
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckpointConfig {
    pub interval_ms: u64,
    /// Checkpoint after this many records instead of on a timer.
    pub every_records: Option<u64>,
    pub mode: CheckpointMode,
    /// How long a checkpoint waits on worker acknowledgements before
    /// it is aborted.
    pub ack_timeout_ms: u64,
    /// Number of durable snapshots kept, the latest included.
    pub retained: usize,
    /// Snapshots in a row that may fail to persist before the
    /// execution fails and the restart supervisor takes over.
    /// Acknowledgement timeouts do not count.
    pub tolerable_failed_checkpoints: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            every_records: None,
            mode: CheckpointMode::ExactlyOnce,
            ack_timeout_ms: 600_000,
            retained: 1,
            tolerable_failed_checkpoints: 3,
        }
    }
}

impl CheckpointConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

/// Failure-rate restart strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RestartConfig {
    /// Restarts allowed within one window.
    pub max_failures: usize,
    pub window_ms: u64,
    pub delay_ms: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_failures: 3,
            window_ms: 10 * 60 * 1000,
            delay_ms: 10_000,
        }
    }
}

impl RestartConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Where durable snapshots are written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageTarget {
    InMemory,
    Sqlite { path: PathBuf },
}

impl EngineConfig {
    pub fn from_json(json: &str) -> EngineResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| config_err(&format!("error parsing configuration: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by any `STATEFLOW_*` environment variables.
    pub fn from_env() -> EngineResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by the variables `lookup` knows about.
    ///
    /// `lookup` is called with full variable names like
    /// `STATEFLOW_PARALLELISM`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> EngineResult<Self> {
        let var = |suffix: &str| lookup(&format!("{ENV_PREFIX}{suffix}"));
        let mut config = Self::default();

        if let Some(value) = var("PARALLELISM") {
            config.parallelism = parse_var("PARALLELISM", &value)?;
        }
        if let Some(value) = var("CHANNEL_CAPACITY") {
            config.channel_capacity = parse_var("CHANNEL_CAPACITY", &value)?;
        }
        if let Some(value) = var("CHECKPOINT_INTERVAL_MS") {
            config.checkpoint.interval_ms = parse_var("CHECKPOINT_INTERVAL_MS", &value)?;
        }
        if let Some(value) = var("CHECKPOINT_EVERY_RECORDS") {
            config.checkpoint.every_records = Some(parse_var("CHECKPOINT_EVERY_RECORDS", &value)?);
        }
        if let Some(value) = var("CHECKPOINT_MODE") {
            config.checkpoint.mode = value.parse()?;
        }
        if let Some(value) = var("ACK_TIMEOUT_MS") {
            config.checkpoint.ack_timeout_ms = parse_var("ACK_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = var("RETAINED_SNAPSHOTS") {
            config.checkpoint.retained = parse_var("RETAINED_SNAPSHOTS", &value)?;
        }
        if let Some(value) = var("TOLERABLE_FAILED_CHECKPOINTS") {
            config.checkpoint.tolerable_failed_checkpoints =
                parse_var("TOLERABLE_FAILED_CHECKPOINTS", &value)?;
        }
        if let Some(value) = var("RESTART_MAX_FAILURES") {
            config.restart.max_failures = parse_var("RESTART_MAX_FAILURES", &value)?;
        }
        if let Some(value) = var("RESTART_WINDOW_MS") {
            config.restart.window_ms = parse_var("RESTART_WINDOW_MS", &value)?;
        }
        if let Some(value) = var("RESTART_DELAY_MS") {
            config.restart.delay_ms = parse_var("RESTART_DELAY_MS", &value)?;
        }
        if let Some(path) = var("SQLITE_PATH") {
            config.storage = StorageTarget::Sqlite { path: path.into() };
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.parallelism == 0 {
            return Err(config_err("parallelism must be at least 1"));
        }
        if self.channel_capacity == 0 {
            return Err(config_err("channel capacity must be at least 1"));
        }
        if self.checkpoint.interval_ms == 0 && self.checkpoint.every_records.is_none() {
            return Err(config_err("checkpoint interval must be positive"));
        }
        if self.checkpoint.every_records == Some(0) {
            return Err(config_err("checkpoint record count must be positive"));
        }
        if self.checkpoint.ack_timeout_ms == 0 {
            return Err(config_err("checkpoint ack timeout must be positive"));
        }
        if self.checkpoint.retained == 0 {
            return Err(config_err("at least one snapshot must be retained"));
        }
        Ok(())
    }
}

fn parse_var<T>(suffix: &str, value: &str) -> EngineResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|err| {
        EngineError::Config(format!("invalid value {value:?} for {ENV_PREFIX}{suffix}: {err}"))
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.parallelism, 4);
        assert_eq!(config.checkpoint.interval(), Duration::from_secs(60));
        assert_eq!(config.checkpoint.mode, CheckpointMode::ExactlyOnce);
        assert_eq!(config.checkpoint.tolerable_failed_checkpoints, 3);
        assert_eq!(config.restart.max_failures, 3);
        assert_eq!(config.restart.window(), Duration::from_secs(600));
        assert_eq!(config.restart.delay(), Duration::from_secs(10));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = EngineConfig::from_json(
            r#"{
                "parallelism": 2,
                "checkpoint": {"every_records": 5, "mode": "at_least_once"},
                "storage": {"type": "sqlite", "path": "/tmp/stateflow.sqlite3"}
            }"#,
        )
        .unwrap();
        assert_eq!(config.parallelism, 2);
        assert_eq!(config.checkpoint.every_records, Some(5));
        assert_eq!(config.checkpoint.mode, CheckpointMode::AtLeastOnce);
        assert_eq!(config.checkpoint.interval_ms, 60_000);
        assert_eq!(
            config.storage,
            StorageTarget::Sqlite {
                path: "/tmp/stateflow.sqlite3".into()
            }
        );
    }

    #[test]
    fn unknown_json_field_is_rejected() {
        let err = EngineConfig::from_json(r#"{"paralelism": 2}"#).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn env_overrides_defaults() {
        let vars = HashMap::from([
            ("STATEFLOW_PARALLELISM", "8"),
            ("STATEFLOW_CHECKPOINT_MODE", "AT_LEAST_ONCE"),
            ("STATEFLOW_RESTART_DELAY_MS", "0"),
            ("STATEFLOW_TOLERABLE_FAILED_CHECKPOINTS", "0"),
            ("STATEFLOW_SQLITE_PATH", "state.sqlite3"),
        ]);
        let config =
            EngineConfig::from_lookup(|name| vars.get(name).map(|value| value.to_string()))
                .unwrap();
        assert_eq!(config.parallelism, 8);
        assert_eq!(config.checkpoint.mode, CheckpointMode::AtLeastOnce);
        assert_eq!(config.restart.delay_ms, 0);
        assert_eq!(config.checkpoint.tolerable_failed_checkpoints, 0);
        assert_eq!(
            config.storage,
            StorageTarget::Sqlite {
                path: "state.sqlite3".into()
            }
        );
    }

    #[test]
    fn invalid_env_value_is_config_error() {
        let err = EngineConfig::from_lookup(|name| {
            (name == "STATEFLOW_PARALLELISM").then(|| "many".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));

        let err = EngineConfig::from_lookup(|name| {
            (name == "STATEFLOW_PARALLELISM").then(|| "0".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }
}
