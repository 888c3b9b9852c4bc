//! Engine configuration.
//!
//! [`EngineConfig`] is plain data: it can be built in code, loaded from JSON,
//! and is validated once before an engine or pool accepts it.  While an
//! engine is running its configuration is frozen.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{NexusError, Result};
use crate::metrics::DEFAULT_MAX_SAMPLES;

/// Tunables for an [`Engine`](crate::Engine) and its worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Workers spawned by `start()`.
    pub num_threads: usize,
    /// Auto-scaling never shrinks below this.
    pub min_threads: usize,
    /// Auto-scaling never grows beyond this.
    pub max_threads: usize,
    /// Maximum pending tasks; must be a power of two.
    pub queue_capacity: usize,
    /// Tasks enqueued per lock acquisition by `submit_batch`.
    pub batch_size: usize,
    /// Upper bound for `wait_idle`.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// Record task outcomes into the metrics collector.
    pub enable_metrics: bool,
    /// Bytes per memory pool block.
    pub block_size: usize,
    /// Number of memory pool blocks.
    pub block_count: usize,
    /// Latency samples retained for percentiles.
    pub max_samples: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let num_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            num_threads,
            min_threads: 1,
            max_threads: num_threads * 2,
            queue_capacity: 65_536,
            batch_size: 1024,
            timeout: Duration::from_millis(5000),
            enable_metrics: true,
            block_size: 4096,
            block_count: 256,
            max_samples: DEFAULT_MAX_SAMPLES,
        }
    }
}

impl EngineConfig {
    /// Defaults with an explicit worker count (scaling bounds follow it).
    pub fn with_threads(num_threads: usize) -> Self {
        Self {
            num_threads,
            min_threads: 1.min(num_threads),
            max_threads: num_threads * 2,
            ..Self::default()
        }
    }

    /// Reject configurations that cannot be run.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(NexusError::InvalidConfig(msg));

        if self.num_threads == 0 {
            return invalid("num_threads must be at least 1".into());
        }
        if self.min_threads > self.num_threads || self.num_threads > self.max_threads {
            return invalid(format!(
                "thread bounds must satisfy min <= num <= max, got {} <= {} <= {}",
                self.min_threads, self.num_threads, self.max_threads
            ));
        }
        if self.queue_capacity < 2 || !self.queue_capacity.is_power_of_two() {
            return invalid(format!(
                "queue_capacity must be a power of two >= 2, got {}",
                self.queue_capacity
            ));
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be at least 1".into());
        }
        if self.block_size == 0 || self.block_count == 0 {
            return invalid("memory pool block_size and block_count must be non-zero".into());
        }
        if self.max_samples == 0 {
            return invalid("max_samples must be at least 1".into());
        }
        Ok(())
    }

    /// Parse and validate a JSON document; missing fields take defaults.
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json).context("malformed engine config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_json_str(&raw).with_context(|| format!("invalid config {}", path.display()))
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.queue_capacity.is_power_of_two());
        assert_eq!(config.timeout, Duration::from_millis(5000));
    }

    #[test]
    fn test_rejects_zero_threads() {
        let config = EngineConfig {
            num_threads: 0,
            min_threads: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(NexusError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_non_power_of_two_capacity() {
        let config = EngineConfig {
            queue_capacity: 100_000,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_thread_bounds() {
        let config = EngineConfig {
            num_threads: 8,
            min_threads: 1,
            max_threads: 4,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_with_threads() {
        let config = EngineConfig::with_threads(3);
        assert_eq!(config.num_threads, 3);
        assert_eq!(config.max_threads, 6);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{ "num_threads": 2, "max_threads": 4, "timeout": 250 }"#,
        )
        .unwrap();
        assert_eq!(config.num_threads, 2);
        assert_eq!(config.timeout, Duration::from_millis(250));
        assert_eq!(config.batch_size, 1024);
    }

    #[test]
    fn test_invalid_json_config_rejected() {
        assert!(EngineConfig::from_json_str(r#"{ "queue_capacity": 3 }"#).is_err());
        assert!(EngineConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_from_file_round_trip() {
        let config = EngineConfig::with_threads(2);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", serde_json::to_string(&config).unwrap()).unwrap();

        let loaded = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_from_missing_file() {
        let err = EngineConfig::from_file("/nonexistent/nexus.json").unwrap_err();
        assert!(err.to_string().contains("failed to read config"));
    }
}
