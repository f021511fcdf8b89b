//! Data models shared by the session manager, the store and the orchestrator.

pub mod decomposition;
pub mod session;

pub use decomposition::{DecompositionRecord, Subtask};

pub use session::{
    Checkpoint, CheckpointKind, ExecutionRecord, NewSession, Session, SessionModelError,
    SessionOutcome, SessionPatch, SessionStatus, TurnOutcome, WorkerSessionState,
};
