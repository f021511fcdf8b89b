//! Session, checkpoint and execution-history records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while converting session records.
#[derive(Error, Debug)]
pub enum SessionModelError {
    /// An unknown status or checkpoint kind string.
    #[error("Unknown {field} value: {value}")]
    UnknownVariant {
        /// Field being parsed.
        field: &'static str,
        /// Offending value.
        value: String,
    },

    /// A checkpoint slice did not deserialize.
    #[error("Checkpoint slice '{slice}' is invalid: {source}")]
    InvalidSlice {
        /// Slice name.
        slice: &'static str,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// A checkpoint belongs to another session.
    #[error("Checkpoint for session {checkpoint_session} cannot restore session {session}")]
    SessionMismatch {
        /// Session being restored.
        session: String,
        /// Session named by the checkpoint.
        checkpoint_session: String,
    },
}

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Accepting turns.
    #[default]
    Active,
    /// Terminated successfully.
    Completed,
    /// Terminated by failure or timeout.
    Failed,
}

impl SessionStatus {
    /// Storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether the session has terminated.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = SessionModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(SessionModelError::UnknownVariant { field: "status", value: other.to_string() }),
        }
    }
}

/// Parameters for creating a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewSession {
    /// Owning user.
    pub user_id: String,
    /// Conversation the session belongs to, if any.
    pub conversation_id: Option<String>,
    /// Prompt that opened the session.
    pub prompt: String,
    /// Maximum number of turns, unlimited when `None`.
    pub max_turns: Option<u32>,
    /// Maximum tokens across all turns, unlimited when `None`.
    pub max_tokens: Option<u64>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl NewSession {
    /// Creates parameters for `user_id` with the opening `prompt`.
    pub fn new(user_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), prompt: prompt.into(), ..Self::default() }
    }

    /// Ties the session to a conversation.
    #[must_use]
    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    /// Sets turn and token budgets.
    #[must_use]
    pub fn with_budget(mut self, max_turns: Option<u32>, max_tokens: Option<u64>) -> Self {
        self.max_turns = max_turns;
        self.max_tokens = max_tokens;
        self
    }
}

/// Per-worker counters kept inside a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerSessionState {
    /// Executions dispatched to the worker in this session.
    pub executions: u64,
    /// Failed executions.
    pub failures: u64,
    /// Tokens consumed.
    pub tokens: u64,
    /// Cost accumulated.
    pub cost_usd: f64,
}

/// Result of one worker execution inside a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnOutcome {
    /// Worker that executed.
    pub worker_id: String,
    /// Whether the execution succeeded.
    pub success: bool,
    /// Tokens consumed.
    pub tokens: u64,
    /// Cost of the execution.
    pub cost_usd: f64,
}

/// Mutation applied through the session manager's update API.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionPatch {
    /// Advance the turn counter by one.
    pub advance_turn: bool,
    /// Executions to fold into the counters.
    pub outcomes: Vec<TurnOutcome>,
    /// Replacement execution-plan state.
    pub plan_state: Option<Value>,
    /// Metadata keys to insert or overwrite.
    pub metadata: Map<String, Value>,
}

impl SessionPatch {
    /// A patch recording one completed turn.
    #[must_use]
    pub fn turn(outcomes: Vec<TurnOutcome>) -> Self {
        Self { advance_turn: true, outcomes, ..Self::default() }
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOutcome {
    /// Completed rather than failed.
    pub success: bool,
    /// Reason recorded on the session.
    pub reason: Option<String>,
}

impl SessionOutcome {
    /// Reason recorded when the cleanup sweep expires a session.
    pub const TIMEOUT_REASON: &'static str = "timeout";

    /// Successful completion.
    #[must_use]
    pub fn success() -> Self {
        Self { success: true, reason: None }
    }

    /// Failed completion with a reason.
    pub fn failure(reason: impl Into<String>) -> Self {
        Self { success: false, reason: Some(reason.into()) }
    }

    /// Failure caused by inactivity.
    #[must_use]
    pub fn timeout() -> Self {
        Self::failure(Self::TIMEOUT_REASON)
    }
}

/// A multi-turn unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier.
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// Conversation the session belongs to.
    pub conversation_id: Option<String>,
    /// Prompt that opened the session.
    pub prompt: String,
    /// Current status.
    pub status: SessionStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Termination time.
    pub completed_at: Option<DateTime<Utc>>,
    /// Turns taken so far.
    pub turn: u32,
    /// Turn budget.
    pub max_turns: Option<u32>,
    /// Token budget.
    pub max_tokens: Option<u64>,
    /// Tokens consumed so far.
    pub tokens_used: u64,
    /// Accumulated cost.
    pub cost_usd: f64,
    /// Running success rate over all executions.
    pub success_rate: f64,
    /// Executions recorded.
    pub execution_count: u64,
    /// Failed executions recorded.
    pub error_count: u64,
    /// Why the session ended.
    pub completion_reason: Option<String>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Execution-plan state.
    #[serde(default)]
    pub plan_state: Value,
    /// Per-worker state, keyed by worker id.
    #[serde(default)]
    pub worker_state: BTreeMap<String, WorkerSessionState>,
}

/// Scalar slice of a session captured in checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScalarState {
    user_id: String,
    conversation_id: Option<String>,
    prompt: String,
    turn: u32,
    max_turns: Option<u32>,
    max_tokens: Option<u64>,
    tokens_used: u64,
    cost_usd: f64,
    success_rate: f64,
    execution_count: u64,
    error_count: u64,
    #[serde(default)]
    metadata: Map<String, Value>,
}

impl Session {
    /// Creates an active session with a fresh UUID.
    #[must_use]
    pub fn new(params: NewSession, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: params.user_id,
            conversation_id: params.conversation_id,
            prompt: params.prompt,
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
            completed_at: None,
            turn: 0,
            max_turns: params.max_turns,
            max_tokens: params.max_tokens,
            tokens_used: 0,
            cost_usd: 0.0,
            success_rate: 1.0,
            execution_count: 0,
            error_count: 0,
            completion_reason: None,
            metadata: params.metadata,
            plan_state: Value::Null,
            worker_state: BTreeMap::new(),
        }
    }

    /// Whether the session accepts turns.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Names the exhausted budget, if any.
    #[must_use]
    pub fn exhausted_budget(&self) -> Option<&'static str> {
        if self.max_turns.is_some_and(|max| self.turn >= max) {
            return Some("turn");
        }
        if self.max_tokens.is_some_and(|max| self.tokens_used >= max) {
            return Some("token");
        }
        None
    }

    /// Time between creation and termination, or until `now` while active.
    #[must_use]
    pub fn duration(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.completed_at.unwrap_or(now) - self.created_at
    }

    /// Applies a patch and stamps `updated_at`.
    pub fn apply(&mut self, patch: SessionPatch, now: DateTime<Utc>) {
        if patch.advance_turn {
            self.turn += 1;
        }

        for outcome in patch.outcomes {
            self.execution_count += 1;
            if !outcome.success {
                self.error_count += 1;
            }
            let successes = self.execution_count - self.error_count;
            self.success_rate = successes as f64 / self.execution_count as f64;
            self.tokens_used += outcome.tokens;
            self.cost_usd += outcome.cost_usd;

            let worker = self.worker_state.entry(outcome.worker_id).or_default();
            worker.executions += 1;
            if !outcome.success {
                worker.failures += 1;
            }
            worker.tokens += outcome.tokens;
            worker.cost_usd += outcome.cost_usd;
        }

        if let Some(plan) = patch.plan_state {
            self.plan_state = plan;
        }
        self.metadata.extend(patch.metadata);
        self.updated_at = now;
    }

    /// Marks the session terminated.
    pub fn finish(&mut self, outcome: &SessionOutcome, now: DateTime<Utc>) {
        self.status = if outcome.success { SessionStatus::Completed } else { SessionStatus::Failed };
        self.completion_reason.clone_from(&outcome.reason);
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Captures the three state slices into a checkpoint.
    ///
    /// # Errors
    /// Returns an error if a slice cannot be serialized.
    pub fn capture(
        &self,
        sequence: u64,
        kind: CheckpointKind,
        now: DateTime<Utc>,
    ) -> Result<Checkpoint, SessionModelError> {
        let scalars = ScalarState {
            user_id: self.user_id.clone(),
            conversation_id: self.conversation_id.clone(),
            prompt: self.prompt.clone(),
            turn: self.turn,
            max_turns: self.max_turns,
            max_tokens: self.max_tokens,
            tokens_used: self.tokens_used,
            cost_usd: self.cost_usd,
            success_rate: self.success_rate,
            execution_count: self.execution_count,
            error_count: self.error_count,
            metadata: self.metadata.clone(),
        };

        Ok(Checkpoint {
            id: Uuid::new_v4().to_string(),
            session_id: self.id.clone(),
            sequence,
            kind,
            created_at: now,
            session_state: to_slice("session_state", &scalars)?,
            plan_state: self.plan_state.clone(),
            worker_state: to_slice("worker_state", &self.worker_state)?,
            turn: self.turn,
            tokens_used: self.tokens_used,
            cost_usd: self.cost_usd,
        })
    }

    /// Rebuilds a session that only exists in a checkpoint.
    ///
    /// Creation time is unknown at that point and is taken from the checkpoint.
    ///
    /// # Errors
    /// Returns an error if a slice fails to deserialize.
    pub fn from_checkpoint(checkpoint: &Checkpoint, now: DateTime<Utc>) -> Result<Self, SessionModelError> {
        let mut session = Self::new(NewSession::default(), checkpoint.created_at);
        session.id.clone_from(&checkpoint.session_id);
        session.restore(checkpoint, now)?;
        Ok(session)
    }

    /// Overwrites mutable state from a checkpoint and reactivates the session.
    ///
    /// # Errors
    /// Returns an error if a slice fails to deserialize or the checkpoint
    /// belongs to another session. The session is unchanged on error.
    pub fn restore(&mut self, checkpoint: &Checkpoint, now: DateTime<Utc>) -> Result<(), SessionModelError> {
        if checkpoint.session_id != self.id {
            return Err(SessionModelError::SessionMismatch {
                session: self.id.clone(),
                checkpoint_session: checkpoint.session_id.clone(),
            });
        }

        let scalars: ScalarState = from_slice("session_state", &checkpoint.session_state)?;
        let workers: BTreeMap<String, WorkerSessionState> =
            from_slice("worker_state", &checkpoint.worker_state)?;

        self.user_id = scalars.user_id;
        self.conversation_id = scalars.conversation_id;
        self.prompt = scalars.prompt;
        self.turn = scalars.turn;
        self.max_turns = scalars.max_turns;
        self.max_tokens = scalars.max_tokens;
        self.tokens_used = scalars.tokens_used;
        self.cost_usd = scalars.cost_usd;
        self.success_rate = scalars.success_rate;
        self.execution_count = scalars.execution_count;
        self.error_count = scalars.error_count;
        self.metadata = scalars.metadata;
        self.plan_state = checkpoint.plan_state.clone();
        self.worker_state = workers;

        self.status = SessionStatus::Active;
        self.completed_at = None;
        self.completion_reason = None;
        self.updated_at = now;
        Ok(())
    }
}

fn to_slice<T: Serialize>(slice: &'static str, value: &T) -> Result<Value, SessionModelError> {
    serde_json::to_value(value).map_err(|source| SessionModelError::InvalidSlice { slice, source })
}

fn from_slice<T: serde::de::DeserializeOwned>(slice: &'static str, value: &Value) -> Result<T, SessionModelError> {
    T::deserialize(value).map_err(|source| SessionModelError::InvalidSlice { slice, source })
}

/// Why a checkpoint was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointKind {
    /// Taken by the recurring timer.
    Periodic,
    /// Requested by a caller.
    Manual,
    /// Written when the session completes.
    Final,
    /// Written when the manager shuts down.
    Shutdown,
}

impl CheckpointKind {
    /// Storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Periodic => "periodic",
            Self::Manual => "manual",
            Self::Final => "final",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointKind {
    type Err = SessionModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "periodic" => Ok(Self::Periodic),
            "manual" => Ok(Self::Manual),
            "final" => Ok(Self::Final),
            "shutdown" => Ok(Self::Shutdown),
            other => Err(SessionModelError::UnknownVariant { field: "checkpoint kind", value: other.to_string() }),
        }
    }
}

/// Durable snapshot of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique checkpoint identifier.
    pub id: String,
    /// Owning session.
    pub session_id: String,
    /// Strictly increasing within the session.
    pub sequence: u64,
    /// Why the checkpoint was taken.
    pub kind: CheckpointKind,
    /// Capture time.
    pub created_at: DateTime<Utc>,
    /// Scalar session state.
    pub session_state: Value,
    /// Execution-plan state.
    pub plan_state: Value,
    /// Per-worker state.
    pub worker_state: Value,
    /// Turn at capture.
    pub turn: u32,
    /// Tokens used at capture.
    pub tokens_used: u64,
    /// Cost at capture.
    pub cost_usd: f64,
}

/// One backend execution, appended to the durable history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Unique record identifier.
    pub id: String,
    /// Session the execution belonged to.
    pub session_id: String,
    /// Worker that executed.
    pub worker_id: String,
    /// Prompt sent to the backend.
    pub prompt: String,
    /// Whether the backend call succeeded.
    pub success: bool,
    /// Backend error message on failure.
    pub error: Option<String>,
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// Prompt tokens reported by the backend.
    pub prompt_tokens: u64,
    /// Completion tokens reported by the backend.
    pub completion_tokens: u64,
    /// Cost reported by the backend.
    pub cost_usd: f64,
    /// When the execution finished.
    pub created_at: DateTime<Utc>,
}

impl ExecutionRecord {
    /// A successful-by-default record stamped now.
    pub fn new(session_id: impl Into<String>, worker_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            worker_id: worker_id.into(),
            prompt: prompt.into(),
            success: true,
            error: None,
            duration_ms: 0,
            prompt_tokens: 0,
            completion_tokens: 0,
            cost_usd: 0.0,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(NewSession::new("user-1", "summarize the logs"), Utc::now())
    }

    #[test]
    fn test_status_round_trip_through_str() {
        for status in [SessionStatus::Active, SessionStatus::Completed, SessionStatus::Failed] {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
        assert!("paused".parse::<SessionStatus>().is_err());
        assert!(SessionStatus::Failed.is_terminal());
    }

    #[test]
    fn test_apply_updates_counters_and_worker_state() {
        let mut session = session();
        session.apply(
            SessionPatch::turn(vec![
                TurnOutcome { worker_id: "w1".into(), success: true, tokens: 100, cost_usd: 0.01 },
                TurnOutcome { worker_id: "w2".into(), success: false, tokens: 0, cost_usd: 0.0 },
            ]),
            Utc::now(),
        );

        assert_eq!(session.turn, 1);
        assert_eq!(session.execution_count, 2);
        assert_eq!(session.error_count, 1);
        assert!((session.success_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(session.tokens_used, 100);
        assert_eq!(session.worker_state["w2"].failures, 1);
    }

    #[test]
    fn test_budget_exhaustion() {
        let mut session = Session::new(
            NewSession::new("u", "p").with_budget(Some(1), Some(1000)),
            Utc::now(),
        );
        assert_eq!(session.exhausted_budget(), None);
        session.apply(SessionPatch::turn(Vec::new()), Utc::now());
        assert_eq!(session.exhausted_budget(), Some("turn"));
    }

    #[test]
    fn test_capture_and_restore_overwrites_state() {
        let mut session = session();
        session.apply(
            SessionPatch {
                plan_state: Some(serde_json::json!({"step": 2})),
                ..SessionPatch::turn(vec![TurnOutcome {
                    worker_id: "w1".into(),
                    success: true,
                    tokens: 42,
                    cost_usd: 0.5,
                }])
            },
            Utc::now(),
        );
        let checkpoint = session.capture(1, CheckpointKind::Manual, Utc::now()).unwrap();

        session.apply(SessionPatch::turn(Vec::new()), Utc::now());
        session.finish(&SessionOutcome::failure("boom"), Utc::now());

        session.restore(&checkpoint, Utc::now()).unwrap();
        assert_eq!(session.turn, 1);
        assert_eq!(session.tokens_used, 42);
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.plan_state, serde_json::json!({"step": 2}));
        assert_eq!(session.worker_state["w1"].executions, 1);
        assert!(session.completion_reason.is_none());
    }

    #[test]
    fn test_restore_rejects_foreign_checkpoint() {
        let source = session();
        let checkpoint = source.capture(1, CheckpointKind::Periodic, Utc::now()).unwrap();
        let mut other = session();
        assert!(matches!(
            other.restore(&checkpoint, Utc::now()),
            Err(SessionModelError::SessionMismatch { .. })
        ));
    }

    #[test]
    fn test_from_checkpoint_rebuilds_session() {
        let source = session();
        let checkpoint = source.capture(3, CheckpointKind::Shutdown, Utc::now()).unwrap();
        let rebuilt = Session::from_checkpoint(&checkpoint, Utc::now()).unwrap();
        assert_eq!(rebuilt.id, source.id);
        assert_eq!(rebuilt.user_id, "user-1");
        assert_eq!(rebuilt.prompt, "summarize the logs");
    }

    #[test]
    fn test_timeout_outcome_marks_failed() {
        let mut session = session();
        session.finish(&SessionOutcome::timeout(), Utc::now());
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(session.completion_reason.as_deref(), Some("timeout"));
        assert!(session.completed_at.is_some());
    }
}
