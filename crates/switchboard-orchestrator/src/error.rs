//! Error types for orchestration.

use serde::Serialize;
use thiserror::Error;

use switchboard_abstraction::ModelError;
use switchboard_core::cache::CacheError;
use switchboard_core::storage::StorageError;

use crate::aggregation::AggregationError;
use crate::config::ConfigError;
use crate::selector::SelectionError;
use crate::session::SessionError;

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

/// Orchestration errors
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// Worker selection failed
    #[error("Selection error: {0}")]
    Selection(#[from] SelectionError),

    /// Aggregation failed
    #[error("Aggregation error: {0}")]
    Aggregation(#[from] AggregationError),

    /// Session lifecycle failure
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Context cache failure
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Durable store failure outside the session manager
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Model backend failure
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The session's turn or token budget is used up
    #[error("Session {session_id} exhausted its {budget} budget")]
    BudgetExhausted {
        /// Session id
        session_id: String,
        /// Which budget: "turn" or "token"
        budget: &'static str,
    },
}

/// Machine-readable error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No candidate matched the request.
    NoSuitableWorker,
    /// A pinned worker's circuit is open.
    CircuitOpen,
    /// Aggregation got no outputs.
    EmptyInput,
    /// Aggregation got no usable outputs.
    NoValidResults,
    /// Session table full.
    CapacityExceeded,
    /// Unknown session.
    SessionNotFound,
    /// Session already ended.
    SessionTerminated,
    /// Missing checkpoint.
    CheckpointNotFound,
    /// Session budget used up.
    BudgetExhausted,
    /// Backend call failed.
    Backend,
    /// Durable store or serialization failure.
    Storage,
    /// Cache failure.
    Cache,
    /// Invalid settings.
    Config,
}

impl OrchestrationError {
    /// Category of the failure, for structured responses.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Selection(SelectionError::NoSuitableWorker { .. }) => ErrorKind::NoSuitableWorker,
            Self::Selection(SelectionError::CircuitOpen { .. }) => ErrorKind::CircuitOpen,
            Self::Aggregation(AggregationError::EmptyInput) => ErrorKind::EmptyInput,
            Self::Aggregation(AggregationError::NoValidResults { .. }) => ErrorKind::NoValidResults,
            Self::Session(e) => match e {
                SessionError::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
                SessionError::SessionNotFound(_) => ErrorKind::SessionNotFound,
                SessionError::SessionTerminated { .. } => ErrorKind::SessionTerminated,
                SessionError::CheckpointNotFound { .. } => ErrorKind::CheckpointNotFound,
                SessionError::Storage(_) | SessionError::Serialization(_) => ErrorKind::Storage,
                SessionError::Config(_) => ErrorKind::Config,
            },
            Self::BudgetExhausted { .. } => ErrorKind::BudgetExhausted,
            Self::Model(_) => ErrorKind::Backend,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Cache(_) => ErrorKind::Cache,
            Self::Config(_) => ErrorKind::Config,
        }
    }
}

/// Serializable view of an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    /// Failure category.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
}

impl From<&OrchestrationError> for ErrorReport {
    fn from(error: &OrchestrationError) -> Self {
        Self { kind: error.kind(), message: error.to_string() }
    }
}
