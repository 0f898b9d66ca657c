//! Engine configuration.
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration:
//!
//! ```toml
//! engine_version = "1.42.0"
//! economy_workers = 4
//! impact_workers = 2
//! queue_capacity = 256
//! submit_timeout_ms = 100
//! poll_interval_ms = 50
//! wait_timeout_ms = 600000
//! stale_after_secs = 3600
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CacheResult, ValidationError};
use crate::record::EngineVersion;

/// Runtime configuration for a [`crate::ComputeEngine`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Version of the simulation engine; part of every cache key.
    pub engine_version: String,
    /// Threads running economy simulations.
    pub economy_workers: usize,
    /// Threads running reform-impact pipelines.
    pub impact_workers: usize,
    /// Maximum queued jobs per pool.
    pub queue_capacity: usize,
    /// How long a submission waits for a queue slot.
    pub submit_timeout_ms: u64,
    /// Interval between store reads while waiting for a record.
    pub poll_interval_ms: u64,
    /// Default upper bound on a blocking wait.
    pub wait_timeout_ms: u64,
    /// Age after which a `computing` row may be reclaimed. `None` disables reclaim.
    pub stale_after_secs: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            engine_version: "0.0.0".to_string(),
            economy_workers: 2,
            impact_workers: 2,
            queue_capacity: 1024,
            submit_timeout_ms: 100,
            poll_interval_ms: 50,
            wait_timeout_ms: 10 * 60 * 1000,
            stale_after_secs: None,
        }
    }
}

impl CacheConfig {
    /// Parse a TOML document.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if the document does not parse or fails
    /// [`CacheConfig::validate`].
    pub fn from_toml_str(raw: &str) -> CacheResult<Self> {
        let config: Self = toml::from_str(raw).map_err(|e| ValidationError::InvalidConfig {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if the file cannot be read or is invalid.
    pub fn load(path: impl AsRef<Path>) -> CacheResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ValidationError::InvalidConfig {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        Self::from_toml_str(&raw)
    }

    /// Reject configurations the engine cannot run with.
    ///
    /// # Errors
    /// Returns `InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |reason: &str| {
            Err(ValidationError::InvalidConfig {
                reason: reason.to_string(),
            })
        };
        if self.engine_version.trim().is_empty() {
            return invalid("engine_version must not be empty");
        }
        if self.economy_workers == 0 || self.impact_workers == 0 {
            return invalid("worker counts must be at least 1");
        }
        if self.queue_capacity == 0 {
            return invalid("queue_capacity must be at least 1");
        }
        if self.poll_interval_ms == 0 {
            return invalid("poll_interval_ms must be at least 1");
        }
        if self.wait_timeout_ms == 0 {
            return invalid("wait_timeout_ms must be at least 1");
        }
        Ok(())
    }

    /// Engine version as a key component.
    #[must_use]
    pub fn engine_version(&self) -> EngineVersion {
        EngineVersion::new(self.engine_version.trim())
    }

    /// Submit timeout as a duration.
    #[must_use]
    pub const fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    /// Poll interval as a duration.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Default wait timeout as a duration.
    #[must_use]
    pub const fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    /// Stale-reservation age, if reclaim is enabled.
    #[must_use]
    pub fn stale_after(&self) -> Option<Duration> {
        self.stale_after_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = CacheConfig::from_toml_str("").unwrap();
        assert_eq!(config, CacheConfig::default());
        assert!(config.stale_after().is_none());
    }

    #[test]
    fn parses_overrides() {
        let config = CacheConfig::from_toml_str(
            r#"
            engine_version = "1.42.0"
            economy_workers = 8
            stale_after_secs = 30
            "#,
        )
        .unwrap();
        assert_eq!(config.engine_version().as_str(), "1.42.0");
        assert_eq!(config.economy_workers, 8);
        assert_eq!(config.impact_workers, 2);
        assert_eq!(config.stale_after(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn rejects_unknown_fields_and_zero_workers() {
        assert!(CacheConfig::from_toml_str("workers = 3").unwrap_err().is_validation());
        assert!(CacheConfig::from_toml_str("impact_workers = 0").is_err());
        assert!(CacheConfig::from_toml_str("engine_version = \"  \"").is_err());
        assert!(CacheConfig::from_toml_str("poll_interval_ms = 0").is_err());
    }

    #[test]
    fn rejects_zero_wait_timeout() {
        let err = CacheConfig::from_toml_str("wait_timeout_ms = 0").unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("wait_timeout_ms"), "{err}");
        assert!(CacheConfig::from_toml_str("wait_timeout_ms = 1").is_ok());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("impactcache.toml");
        std::fs::write(&path, "queue_capacity = 7\n").unwrap();
        assert_eq!(CacheConfig::load(&path).unwrap().queue_capacity, 7);
        assert!(CacheConfig::load(dir.path().join("missing.toml")).is_err());
    }
}
