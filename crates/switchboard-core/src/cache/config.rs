//! Configuration for the adaptive cache.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration for the adaptive context cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Maximum number of entries held at once (default: 1000).
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Upper bound on the estimated payload bytes held at once (default: 64 MiB).
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: usize,

    /// TTL applied when `put` is called without one, in milliseconds. `None` means entries never expire.
    #[serde(default)]
    pub default_ttl_ms: Option<u64>,

    /// How often the expiry sweep runs in seconds (default: 60).
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// How often the compression sweep runs in seconds (default: 300).
    #[serde(default = "default_compression_interval_secs")]
    pub compression_interval_secs: u64,

    /// Entries at least this large are compressed by the sweep (default: 4096).
    #[serde(default = "default_compression_threshold_bytes")]
    pub compression_threshold_bytes: usize,

    /// Window used to decide whether a key is hot, in seconds (default: 300).
    #[serde(default = "default_hot_window_secs")]
    pub hot_window_secs: u64,

    /// Accesses inside the hot window needed to classify a key as hot (default: 10).
    #[serde(default = "default_hot_access_threshold")]
    pub hot_access_threshold: usize,

    /// A key untouched for this long is cold, in seconds (default: 3600).
    #[serde(default = "default_cold_after_secs")]
    pub cold_after_secs: u64,
}

fn default_max_entries() -> usize {
    1000
}

fn default_max_memory_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

fn default_compression_interval_secs() -> u64 {
    300
}

fn default_compression_threshold_bytes() -> usize {
    4096
}

fn default_hot_window_secs() -> u64 {
    300
}

fn default_hot_access_threshold() -> usize {
    10
}

fn default_cold_after_secs() -> u64 {
    3600
}

/// Errors that can occur during cache configuration validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheConfigError {
    /// Invalid max entries (must be > 0).
    #[error("Invalid max entries: must be greater than 0")]
    InvalidMaxEntries,

    /// Invalid memory bound (must be > 0).
    #[error("Invalid max memory: must be greater than 0")]
    InvalidMaxMemory,

    /// A sweep interval was zero.
    #[error("Invalid {0} interval: must be greater than 0")]
    InvalidInterval(&'static str),

    /// The hot window must be shorter than the cold threshold.
    #[error("Invalid access windows: hot window ({hot}s) must be shorter than cold threshold ({cold}s)")]
    InvalidAccessWindows {
        /// Hot window in seconds.
        hot: u64,
        /// Cold threshold in seconds.
        cold: u64,
    },
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            max_memory_bytes: default_max_memory_bytes(),
            default_ttl_ms: None,
            cleanup_interval_secs: default_cleanup_interval_secs(),
            compression_interval_secs: default_compression_interval_secs(),
            compression_threshold_bytes: default_compression_threshold_bytes(),
            hot_window_secs: default_hot_window_secs(),
            hot_access_threshold: default_hot_access_threshold(),
            cold_after_secs: default_cold_after_secs(),
        }
    }
}

impl CacheConfig {
    /// Validate the cache configuration.
    ///
    /// # Errors
    /// Returns `CacheConfigError` if any configuration value is invalid.
    pub fn validate(&self) -> Result<(), CacheConfigError> {
        if self.max_entries == 0 {
            return Err(CacheConfigError::InvalidMaxEntries);
        }

        if self.max_memory_bytes == 0 {
            return Err(CacheConfigError::InvalidMaxMemory);
        }

        if self.cleanup_interval_secs == 0 {
            return Err(CacheConfigError::InvalidInterval("cleanup"));
        }

        if self.compression_interval_secs == 0 {
            return Err(CacheConfigError::InvalidInterval("compression"));
        }

        if self.hot_window_secs >= self.cold_after_secs {
            return Err(CacheConfigError::InvalidAccessWindows {
                hot: self.hot_window_secs,
                cold: self.cold_after_secs,
            });
        }

        Ok(())
    }

    /// Get the default TTL as a Duration.
    #[must_use]
    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_ms.map(Duration::from_millis)
    }

    /// Get the cleanup interval as a Duration.
    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Get the compression interval as a Duration.
    #[must_use]
    pub fn compression_interval(&self) -> Duration {
        Duration::from_secs(self.compression_interval_secs)
    }

    /// Get the hot window as a Duration.
    #[must_use]
    pub fn hot_window(&self) -> Duration {
        Duration::from_secs(self.hot_window_secs)
    }

    /// Get the cold threshold as a Duration.
    #[must_use]
    pub fn cold_after(&self) -> Duration {
        Duration::from_secs(self.cold_after_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_config_default() {
        let config = CacheConfig::default();
        assert_eq!(config.max_entries, 1000);
        assert_eq!(config.cleanup_interval_secs, 60);
        assert!(config.default_ttl().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cache_config_validation_invalid_max_entries() {
        let config = CacheConfig { max_entries: 0, ..CacheConfig::default() };
        assert_eq!(config.validate(), Err(CacheConfigError::InvalidMaxEntries));
    }

    #[test]
    fn test_cache_config_validation_invalid_interval() {
        let config = CacheConfig { compression_interval_secs: 0, ..CacheConfig::default() };
        assert_eq!(config.validate(), Err(CacheConfigError::InvalidInterval("compression")));
    }

    #[test]
    fn test_cache_config_validation_windows() {
        let config = CacheConfig { hot_window_secs: 600, cold_after_secs: 600, ..CacheConfig::default() };
        assert!(matches!(config.validate(), Err(CacheConfigError::InvalidAccessWindows { .. })));
    }

    #[test]
    fn test_cache_config_from_partial_toml_fields() {
        let config: CacheConfig = serde_json::from_str(r#"{"max_entries": 5, "default_ttl_ms": 1000}"#).unwrap();
        assert_eq!(config.max_entries, 5);
        assert_eq!(config.default_ttl(), Some(Duration::from_millis(1000)));
        assert_eq!(config.compression_threshold_bytes, 4096);
    }
}
