//! Session lifecycle: creation, checkpoints, restore and expiry.

pub mod config;
pub mod manager;

pub use config::{SessionConfig, SessionConfigError};
pub use manager::{SessionError, SessionManager, SessionMetrics};
