//! Worker orchestration for Switchboard.
//!
//! Routes free-text requests to capability-tagged workers and runs them
//! against a model backend:
//! - [`selector::CapabilitySelector`] scores workers, balances load among
//!   near-ties and isolates failing workers behind circuit breakers
//! - [`aggregation::Aggregator`] merges several workers' outputs
//! - [`session::SessionManager`] owns multi-turn sessions and checkpoints
//! - [`Orchestrator`] composes them with the context cache from
//!   `switchboard-core`

pub mod aggregation;
pub mod capability;
pub mod config;
pub mod error;
pub mod load_balancer;
pub mod orchestrator;
pub mod registry;
pub mod routing;
pub mod selector;
pub mod session;

pub use aggregation::{AggregatedResult, AggregationContext, AggregationStrategy, Aggregator, WorkerOutput};
pub use capability::{Capability, CapabilitySet, Category, PriorityTier, RequestAnalyzer, SelectionRequest};
pub use config::{ConfigError, OrchestratorConfig};
pub use error::{ErrorKind, ErrorReport, OrchestrationError, Result};
pub use orchestrator::{
    MultiWorkerResponse, OrchestrationOptions, OrchestrationRequest, OrchestrationResponse, Orchestrator,
};
pub use registry::{ExecutionOutcome, WorkerDescriptor, WorkerRegistry};
pub use routing::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use selector::{CapabilitySelector, SelectionError, SelectionResult, SelectionStrategy, SelectorConfig};
pub use session::{SessionConfig, SessionError, SessionManager, SessionMetrics};
