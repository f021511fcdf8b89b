//! Switchboard Core - storage, session records and the adaptive cache.
//!
//! This crate provides the pieces of the orchestrator that do not depend on
//! worker selection:
//! - [`cache::AdaptiveCache`], a bounded priority-aware context cache
//! - [`storage::SqliteSessionStore`], durable sessions, checkpoints and history
//! - [`models`], the session and checkpoint records both of them carry
//! - [`logging::init_tracing`], the shared tracing setup
//!
//! # Example
//!
//! ```rust,no_run
//! use switchboard_core::cache::{AdaptiveCache, CacheConfig, PutOptions};
//!
//! # async fn demo() -> Result<(), switchboard_core::cache::CacheError> {
//! let cache = AdaptiveCache::new(CacheConfig::default())?;
//! cache.put("context:abc", &vec!["hello"], PutOptions::default()).await?;
//! assert!(cache.get("context:abc").await.is_some());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod logging;
pub mod models;
pub mod storage;

pub use cache::{AdaptiveCache, CacheConfig, CacheError, CachePriority, CacheStats, PutOptions};
pub use models::{
    Checkpoint, CheckpointKind, DecompositionRecord, ExecutionRecord, NewSession, Session, SessionOutcome, SessionPatch,
    SessionStatus, Subtask, TurnOutcome,
};
pub use storage::{Database, SessionStore, SqliteSessionStore, StorageError, StorageResult};
