//! Failure isolation and candidate scoring for worker selection.

pub mod circuit_breaker;
pub mod scoring;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigError, CircuitState};
pub use scoring::{ScoreBreakdown, ScoreWeights, performance_score, score_worker};
