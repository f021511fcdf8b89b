//! TOML configuration for the orchestrator and its components.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use switchboard_core::cache::CacheConfig;

use crate::aggregation::AggregatorConfig;
use crate::routing::CircuitBreakerConfig;
use crate::selector::SelectorConfig;
use crate::session::SessionConfig;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading the file.
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("Failed to parse TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error.
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Orchestrator configuration, one section per component.
///
/// ```toml
/// batch_concurrency = 3
///
/// [selector]
/// default_strategy = "balanced"
///
/// [circuit_breaker]
/// failure_threshold = 5
///
/// [session]
/// max_sessions = 100
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Worker selection.
    #[serde(default)]
    pub selector: SelectorConfig,

    /// Per-worker failure isolation.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Multi-worker result aggregation.
    #[serde(default)]
    pub aggregation: AggregatorConfig,

    /// Session lifecycle.
    #[serde(default)]
    pub session: SessionConfig,

    /// Context cache.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Requests or workers in flight per batch (default: 3).
    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,

    /// Prior exchanges prepended to a prompt from the context cache (default: 5).
    #[serde(default = "default_context_turns")]
    pub context_turns: usize,

    /// Lifetime of cached session context in seconds (default: 3600).
    #[serde(default = "default_context_ttl_secs")]
    pub context_ttl_secs: u64,
}

fn default_batch_concurrency() -> usize {
    3
}

fn default_context_turns() -> usize {
    5
}

fn default_context_ttl_secs() -> u64 {
    3600
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            selector: SelectorConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            aggregation: AggregatorConfig::default(),
            session: SessionConfig::default(),
            cache: CacheConfig::default(),
            batch_concurrency: default_batch_concurrency(),
            context_turns: default_context_turns(),
            context_ttl_secs: default_context_ttl_secs(),
        }
    }
}

impl OrchestratorConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Arguments
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    /// Returns error if file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parses and validates configuration from a TOML string.
    ///
    /// # Errors
    /// Returns error if the text cannot be parsed or validated.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every section.
    ///
    /// # Errors
    /// Returns `ConfigError::Validation` naming the offending section.
    pub fn validate(&self) -> Result<()> {
        fn section(name: &str, e: impl std::fmt::Display) -> ConfigError {
            ConfigError::Validation(format!("[{name}] {e}"))
        }

        self.selector.validate().map_err(|e| section("selector", e))?;
        self.circuit_breaker.validate().map_err(|e| section("circuit_breaker", e))?;
        self.aggregation.validate().map_err(|e| section("aggregation", e))?;
        self.session.validate().map_err(|e| section("session", e))?;
        self.cache.validate().map_err(|e| section("cache", e))?;

        if self.batch_concurrency == 0 {
            return Err(ConfigError::Validation("batch_concurrency must be greater than 0".to_string()));
        }
        if self.context_ttl_secs == 0 {
            return Err(ConfigError::Validation("context_ttl_secs must be greater than 0".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::SelectionStrategy;
    use std::io::Write;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = OrchestratorConfig::from_toml_str("").unwrap();
        assert_eq!(config, OrchestratorConfig::default());
        assert_eq!(config.batch_concurrency, 3);
    }

    #[test]
    fn test_sections_override_defaults() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            batch_concurrency = 8
            context_turns = 2

            [selector]
            default_strategy = "least_loaded"
            tie_tolerance = 0.1

            [circuit_breaker]
            failure_threshold = 3

            [session]
            max_sessions = 7
            "#,
        )
        .unwrap();

        assert_eq!(config.batch_concurrency, 8);
        assert_eq!(config.context_turns, 2);
        assert_eq!(config.selector.default_strategy, SelectionStrategy::LeastLoaded);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.session.max_sessions, 7);
        assert_eq!(config.session.checkpoint_interval_secs, 30);
    }

    #[test]
    fn test_invalid_section_is_named() {
        let err = OrchestratorConfig::from_toml_str("[session]\nmax_sessions = 0\n").unwrap_err();
        match err {
            ConfigError::Validation(msg) => assert!(msg.starts_with("[session]"), "{msg}"),
            other => panic!("unexpected error: {other}"),
        }

        let err = OrchestratorConfig::from_toml_str("batch_concurrency = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[aggregation]\nagreement_threshold = 0.8").unwrap();
        let config = OrchestratorConfig::load(file.path()).unwrap();
        assert!((config.aggregation.agreement_threshold - 0.8).abs() < f64::EPSILON);

        let missing = OrchestratorConfig::load(Path::new("/definitely/not/here.toml"));
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }
}
