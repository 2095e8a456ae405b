//! Runtime configuration.
//!
//! Values come from an optional JSON file and are then overlaid with
//! `TASKRELAY_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::batch::BatchOptions;
use crate::circuit::CircuitBreakerConfig;
use crate::errors::{ResilienceError, Result};
use crate::retry::RetryConfig;

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "TASKRELAY_";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskrelayConfig {
    /// Default retry policy for stages and batch items.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Circuit breaker thresholds.
    #[serde(default)]
    pub circuit: CircuitBreakerConfig,
    /// Default batch scheduling.
    #[serde(default)]
    pub batch: BatchOptions,
    /// Ledger file; `None` keeps the ledger in memory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_path: Option<PathBuf>,
    /// Seconds between scheduled runs.
    #[serde(default = "default_trigger_interval_secs")]
    pub trigger_interval_secs: u64,
    /// Log output settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_trigger_interval_secs() -> u64 {
    300
}

impl Default for TaskrelayConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            circuit: CircuitBreakerConfig::default(),
            batch: BatchOptions::default(),
            ledger_path: None,
            trigger_interval_secs: default_trigger_interval_secs(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset, e.g. `info` or
    /// `taskrelay=debug`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit one JSON object per line instead of human-readable text.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl TaskrelayConfig {
    /// Loads a configuration file. Missing keys take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ResilienceError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&text)
            .map_err(|e| ResilienceError::Config(format!("{}: {e}", path.display())))
    }

    /// Parses a JSON document.
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| ResilienceError::Config(e.to_string()))
    }

    /// Applies overrides from the process environment.
    pub fn apply_env(self) -> Result<Self> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup`, which maps a variable name to its
    /// value.
    ///
    /// Recognized variables: `TASKRELAY_RETRY_MAX_ATTEMPTS`,
    /// `TASKRELAY_RETRY_BASE_DELAY_MS`, `TASKRELAY_RETRY_MULTIPLIER`,
    /// `TASKRELAY_RETRY_JITTER`, `TASKRELAY_CIRCUIT_THRESHOLD`,
    /// `TASKRELAY_CIRCUIT_RESET_MS`, `TASKRELAY_BATCH_MAX_CONCURRENCY`,
    /// `TASKRELAY_LEDGER_PATH`, `TASKRELAY_TRIGGER_INTERVAL_SECS`,
    /// `TASKRELAY_LOG_LEVEL` and `TASKRELAY_LOG_JSON`.
    pub fn apply_env_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = var("RETRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse("RETRY_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = var("RETRY_BASE_DELAY_MS") {
            self.retry.base_delay_ms = parse("RETRY_BASE_DELAY_MS", &v)?;
        }
        if let Some(v) = var("RETRY_MULTIPLIER") {
            self.retry.backoff_multiplier = parse("RETRY_MULTIPLIER", &v)?;
        }
        if let Some(v) = var("RETRY_JITTER") {
            self.retry.jitter_fraction = parse("RETRY_JITTER", &v)?;
        }
        if let Some(v) = var("CIRCUIT_THRESHOLD") {
            self.circuit.failure_threshold = parse("CIRCUIT_THRESHOLD", &v)?;
        }
        if let Some(v) = var("CIRCUIT_RESET_MS") {
            self.circuit.reset_timeout_ms = parse("CIRCUIT_RESET_MS", &v)?;
        }
        if let Some(v) = var("BATCH_MAX_CONCURRENCY") {
            self.batch.max_concurrency = parse("BATCH_MAX_CONCURRENCY", &v)?;
        }
        if let Some(v) = var("LEDGER_PATH") {
            self.ledger_path = (!v.trim().is_empty()).then(|| PathBuf::from(v));
        }
        if let Some(v) = var("TRIGGER_INTERVAL_SECS") {
            self.trigger_interval_secs = parse("TRIGGER_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = var("LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = var("LOG_JSON") {
            self.logging.json = parse_flag("LOG_JSON", &v)?;
        }
        Ok(self)
    }

    /// Checks every range constraint.
    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        self.circuit.validate()?;
        self.batch.validate()?;
        if self.trigger_interval_secs == 0 {
            return Err(ResilienceError::Config(
                "trigger_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Interval between scheduled runs.
    #[must_use]
    pub fn trigger_interval(&self) -> Duration {
        Duration::from_secs(self.trigger_interval_secs)
    }
}

fn parse<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ResilienceError::Config(format!("{ENV_PREFIX}{name}={value:?}: {e}")))
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ResilienceError::Config(format!(
            "{ENV_PREFIX}{name}={value:?}: expected a boolean"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = TaskrelayConfig::from_json_str("{}").unwrap();
        assert_eq!(config, TaskrelayConfig::default());
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.circuit.failure_threshold, 5);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_document_keeps_other_defaults() {
        let config = TaskrelayConfig::from_json_str(
            r#"{"retry": {"max_attempts": 5}, "ledger_path": "/var/lib/taskrelay/ledger.json"}"#,
        )
        .unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(
            config.ledger_path,
            Some(PathBuf::from("/var/lib/taskrelay/ledger.json"))
        );
    }

    #[test]
    fn test_env_overrides_file_values() {
        let config = TaskrelayConfig::default()
            .apply_env_from(env(&[
                ("TASKRELAY_RETRY_MAX_ATTEMPTS", "7"),
                ("TASKRELAY_RETRY_BASE_DELAY_MS", "250"),
                ("TASKRELAY_CIRCUIT_THRESHOLD", "2"),
                ("TASKRELAY_LEDGER_PATH", "/tmp/ledger.json"),
                ("TASKRELAY_LOG_JSON", "true"),
            ]))
            .unwrap();

        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.retry.base_delay_ms, 250);
        assert_eq!(config.circuit.failure_threshold, 2);
        assert_eq!(config.ledger_path, Some(PathBuf::from("/tmp/ledger.json")));
        assert!(config.logging.json);
    }

    #[test]
    fn test_bad_env_value_is_config_error() {
        let err = TaskrelayConfig::default()
            .apply_env_from(env(&[("TASKRELAY_RETRY_MAX_ATTEMPTS", "many")]))
            .unwrap_err();
        assert!(matches!(err, ResilienceError::Config(msg) if msg.contains("RETRY_MAX_ATTEMPTS")));
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut config = TaskrelayConfig::default();
        config.batch.max_concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = TaskrelayConfig::default();
        config.trigger_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("taskrelay.json");
        std::fs::write(&path, r#"{"trigger_interval_secs": 60, "logging": {"level": "debug"}}"#).unwrap();

        let config = TaskrelayConfig::from_json_file(&path).unwrap();
        assert_eq!(config.trigger_interval(), Duration::from_secs(60));
        assert_eq!(config.logging.level, "debug");

        let missing = TaskrelayConfig::from_json_file(dir.path().join("absent.json"));
        assert!(matches!(missing, Err(ResilienceError::Config(_))));
    }
}
