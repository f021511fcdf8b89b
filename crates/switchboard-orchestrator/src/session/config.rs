//! Session manager configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Session manager settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum concurrently active sessions (default: 100).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Interval between periodic checkpoints in seconds (default: 30).
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,

    /// Checkpoints kept in memory per session (default: 10).
    #[serde(default = "default_max_checkpoints_in_memory")]
    pub max_checkpoints_in_memory: usize,

    /// Idle time after which a session expires, in seconds (default: 1800).
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,

    /// Interval between cleanup sweeps in seconds (default: 60).
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Terminated sessions kept in memory (default: 1000).
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Age after which terminated sessions are purged, in seconds (default: 86400).
    #[serde(default = "default_history_retention_secs")]
    pub history_retention_secs: u64,
}

fn default_max_sessions() -> usize {
    100
}

fn default_checkpoint_interval_secs() -> u64 {
    30
}

fn default_max_checkpoints_in_memory() -> usize {
    10
}

fn default_session_timeout_secs() -> u64 {
    1800
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

fn default_history_limit() -> usize {
    1000
}

fn default_history_retention_secs() -> u64 {
    86_400
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
            max_checkpoints_in_memory: default_max_checkpoints_in_memory(),
            session_timeout_secs: default_session_timeout_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            history_limit: default_history_limit(),
            history_retention_secs: default_history_retention_secs(),
        }
    }
}

/// Invalid session settings.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0} must be greater than 0")]
pub struct SessionConfigError(pub &'static str);

impl SessionConfig {
    /// Validates the settings.
    ///
    /// # Errors
    /// Returns the first zero-valued setting.
    pub fn validate(&self) -> Result<(), SessionConfigError> {
        let checks = [
            ("max_sessions", self.max_sessions as u64),
            ("checkpoint_interval_secs", self.checkpoint_interval_secs),
            ("max_checkpoints_in_memory", self.max_checkpoints_in_memory as u64),
            ("session_timeout_secs", self.session_timeout_secs),
            ("cleanup_interval_secs", self.cleanup_interval_secs),
            ("history_retention_secs", self.history_retention_secs),
        ];
        match checks.iter().find(|(_, value)| *value == 0) {
            Some((name, _)) => Err(SessionConfigError(*name)),
            None => Ok(()),
        }
    }

    /// Get the checkpoint interval as a Duration.
    #[must_use]
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }

    /// Get the cleanup interval as a Duration.
    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Get the idle timeout as a chrono Duration.
    #[must_use]
    pub fn session_timeout(&self) -> chrono::Duration {
        chrono_secs(self.session_timeout_secs)
    }

    /// Get the history retention as a chrono Duration.
    #[must_use]
    pub fn history_retention(&self) -> chrono::Duration {
        chrono_secs(self.history_retention_secs)
    }
}

fn chrono_secs(secs: u64) -> chrono::Duration {
    let secs = i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1000);
    chrono::Duration::seconds(secs)
}
