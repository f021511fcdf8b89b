//! Session lifecycle management.
//!
//! Active sessions live in a table of per-session async mutexes so each
//! read-mutate-persist cycle on one session is serialized while different
//! sessions proceed independently. Every mutation is written through to the
//! [`SessionStore`]; checkpoints are kept both in memory (newest N) and
//! durably, which is what lets a restarted process restore a session it has
//! never seen.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use switchboard_core::models::{
    Checkpoint, CheckpointKind, NewSession, Session, SessionModelError, SessionOutcome, SessionPatch, SessionStatus,
};
use switchboard_core::storage::{SessionStore, StorageError};

use super::config::{SessionConfig, SessionConfigError};

/// Errors that can occur in the session manager.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The active-session table is full.
    #[error("Session capacity exceeded (max {max} active sessions)")]
    CapacityExceeded {
        /// Configured maximum.
        max: usize,
    },

    /// No session with this id exists.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// The session has already ended.
    #[error("Session {session_id} is {status}")]
    SessionTerminated {
        /// Session id.
        session_id: String,
        /// Terminal status.
        status: SessionStatus,
    },

    /// No checkpoint matches.
    #[error("Checkpoint not found for session {session_id} (sequence {sequence:?})")]
    CheckpointNotFound {
        /// Session id.
        session_id: String,
        /// Requested sequence, `None` for latest.
        sequence: Option<u64>,
    },

    /// Durable store failure.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Checkpoint slice (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] SessionModelError),

    /// Invalid settings.
    #[error("Invalid session configuration: {0}")]
    Config(#[from] SessionConfigError),
}

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SessionMetrics {
    /// Sessions created by this manager.
    pub total_sessions: u64,
    /// Sessions currently active.
    pub active_sessions: usize,
    /// Sessions completed successfully.
    pub completed_sessions: u64,
    /// Sessions that failed or timed out.
    pub failed_sessions: u64,
    /// Successful restores.
    pub restored_sessions: u64,
    /// Checkpoints written.
    pub checkpoints_created: u64,
    /// Mean lifetime of terminated sessions, in seconds.
    pub average_duration_secs: f64,
}

struct SlotState {
    session: Session,
    checkpoints: VecDeque<Checkpoint>,
    next_sequence: u64,
    timer: Option<CancellationToken>,
}

type Slot = Arc<Mutex<SlotState>>;

fn ensure_active(session: &Session) -> Result<()> {
    if session.is_active() {
        Ok(())
    } else {
        Err(SessionError::SessionTerminated { session_id: session.id.clone(), status: session.status })
    }
}

/// Owns every active session, its checkpoint timer and the session history.
pub struct SessionManager {
    config: SessionConfig,
    store: Arc<dyn SessionStore>,
    active: RwLock<HashMap<String, Slot>>,
    history: StdMutex<VecDeque<Session>>,
    metrics: StdMutex<SessionMetrics>,
    creation: Mutex<()>,
    shutdown: CancellationToken,
    cleanup_task: StdMutex<Option<JoinHandle<()>>>,
    this: Weak<Self>,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.config)
            .field("active_sessions", &self.active.try_read().map(|a| a.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl SessionManager {
    /// Creates a session manager over a durable store.
    ///
    /// # Errors
    /// Returns `SessionError::Config` if the settings are invalid.
    pub fn new(config: SessionConfig, store: Arc<dyn SessionStore>) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new_cyclic(|this| Self {
            config,
            store,
            active: RwLock::new(HashMap::new()),
            history: StdMutex::new(VecDeque::new()),
            metrics: StdMutex::new(SessionMetrics::default()),
            creation: Mutex::new(()),
            shutdown: CancellationToken::new(),
            cleanup_task: StdMutex::new(None),
            this: this.clone(),
        }))
    }

    fn lock_history(&self) -> MutexGuard<'_, VecDeque<Session>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_metrics(&self) -> MutexGuard<'_, SessionMetrics> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn slot(&self, session_id: &str) -> Option<Slot> {
        self.active.read().await.get(session_id).cloned()
    }

    /// The slot of an active session, or the reason there is none.
    async fn active_slot(&self, session_id: &str) -> Result<Slot> {
        if let Some(slot) = self.slot(session_id).await {
            return Ok(slot);
        }
        let session = self.get_session(session_id).await?;
        Err(SessionError::SessionTerminated { session_id: session.id, status: session.status })
    }

    /// Creates a new active session.
    ///
    /// # Errors
    /// Returns `SessionError::CapacityExceeded` when `max_sessions` sessions
    /// are active, or a storage error if the initial write fails.
    pub async fn create_session(&self, params: NewSession) -> Result<Session> {
        let session = Session::new(params, Utc::now());
        let id = session.id.clone();

        {
            let mut active = self.active.write().await;
            if active.len() >= self.config.max_sessions {
                warn!(max = self.config.max_sessions, "Session capacity exceeded");
                return Err(SessionError::CapacityExceeded { max: self.config.max_sessions });
            }
            let state = SlotState {
                session: session.clone(),
                checkpoints: VecDeque::new(),
                next_sequence: 1,
                timer: Some(self.arm_checkpoint_timer(&id)),
            };
            active.insert(id.clone(), Arc::new(Mutex::new(state)));
        }

        if let Err(e) = self.store.upsert_session(&session).await {
            let removed = self.active.write().await.remove(&id);
            if let Some(slot) = removed {
                if let Some(timer) = slot.lock().await.timer.take() {
                    timer.cancel();
                }
            }
            error!(session_id = %id, error = %e, "Failed to persist new session");
            return Err(e.into());
        }

        self.lock_metrics().total_sessions += 1;
        info!(session_id = %id, user_id = %session.user_id, "Created session");
        Ok(session)
    }

    /// Returns the active session of a conversation, creating one if needed.
    ///
    /// Without a conversation id a new session is always created.
    ///
    /// # Errors
    /// Same as [`SessionManager::create_session`].
    pub async fn get_or_create_session(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
        prompt: &str,
    ) -> Result<Session> {
        let _creation = self.creation.lock().await;

        if let Some(conversation) = conversation_id {
            let slots: Vec<Slot> = self.active.read().await.values().cloned().collect();
            for slot in slots {
                let state = slot.lock().await;
                let session = &state.session;
                if session.is_active()
                    && session.user_id == user_id
                    && session.conversation_id.as_deref() == Some(conversation)
                {
                    debug!(session_id = %session.id, conversation_id = %conversation, "Reusing conversation session");
                    return Ok(session.clone());
                }
            }
        }

        let mut params = NewSession::new(user_id, prompt);
        if let Some(conversation) = conversation_id {
            params = params.with_conversation(conversation);
        }
        self.create_session(params).await
    }

    /// Looks a session up in memory, then in history, then in the store.
    ///
    /// # Errors
    /// Returns `SessionError::SessionNotFound` if no record exists anywhere.
    pub async fn get_session(&self, session_id: &str) -> Result<Session> {
        if let Some(slot) = self.slot(session_id).await {
            return Ok(slot.lock().await.session.clone());
        }
        let archived = self.lock_history().iter().find(|s| s.id == session_id).cloned();
        if let Some(session) = archived {
            return Ok(session);
        }
        self.store
            .load_session(session_id)
            .await?
            .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))
    }

    /// Applies a patch to an active session and persists it.
    ///
    /// # Errors
    /// Returns `SessionError::SessionNotFound` or
    /// `SessionError::SessionTerminated` when the session cannot be updated.
    pub async fn update_session(&self, session_id: &str, patch: SessionPatch) -> Result<Session> {
        let slot = self.active_slot(session_id).await?;
        let mut state = slot.lock().await;
        ensure_active(&state.session)?;

        state.session.apply(patch, Utc::now());
        self.store.upsert_session(&state.session).await?;
        debug!(session_id = %session_id, turn = state.session.turn, "Updated session");
        Ok(state.session.clone())
    }

    /// Terminates a session with a final checkpoint and moves it to history.
    ///
    /// # Errors
    /// Returns `SessionError::SessionTerminated` if it already ended, or the
    /// storage error of the final write (the session is terminated in memory
    /// regardless).
    pub async fn complete_session(&self, session_id: &str, outcome: SessionOutcome) -> Result<Session> {
        let completed = self.complete_at(session_id, &outcome, Utc::now(), None).await?;
        completed.ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))
    }

    /// Completes the session unless it was touched at or after `idle_before`.
    async fn complete_at(
        &self,
        session_id: &str,
        outcome: &SessionOutcome,
        now: DateTime<Utc>,
        idle_before: Option<DateTime<Utc>>,
    ) -> Result<Option<Session>> {
        let slot = self.active_slot(session_id).await?;
        let mut state = slot.lock().await;
        ensure_active(&state.session)?;
        if idle_before.is_some_and(|cutoff| state.session.updated_at >= cutoff) {
            return Ok(None);
        }

        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
        state.session.finish(outcome, now);
        let durable = self.write_checkpoint(&mut state, CheckpointKind::Final, now).await;
        let session = state.session.clone();
        drop(state);

        self.active.write().await.remove(session_id);
        self.archive(&session, now);
        info!(
            session_id = %session_id,
            status = %session.status,
            reason = session.completion_reason.as_deref().unwrap_or(""),
            "Session ended"
        );

        if let Err(e) = durable {
            error!(session_id = %session_id, error = %e, "Final checkpoint failed");
            return Err(e);
        }
        Ok(Some(session))
    }

    fn archive(&self, session: &Session, now: DateTime<Utc>) {
        {
            let mut history = self.lock_history();
            history.push_back(session.clone());
            while history.len() > self.config.history_limit {
                history.pop_front();
            }
        }

        let mut metrics = self.lock_metrics();
        if session.status == SessionStatus::Completed {
            metrics.completed_sessions += 1;
        } else {
            metrics.failed_sessions += 1;
        }
        let finished = (metrics.completed_sessions + metrics.failed_sessions) as f64;
        let duration = session.duration(now).num_milliseconds() as f64 / 1000.0;
        metrics.average_duration_secs += (duration - metrics.average_duration_secs) / finished;
    }

    async fn write_checkpoint(
        &self,
        state: &mut SlotState,
        kind: CheckpointKind,
        now: DateTime<Utc>,
    ) -> Result<Checkpoint> {
        let checkpoint = state.session.capture(state.next_sequence, kind, now)?;
        self.store.save_checkpoint(&state.session, &checkpoint).await?;

        state.next_sequence += 1;
        state.checkpoints.push_back(checkpoint.clone());
        while state.checkpoints.len() > self.config.max_checkpoints_in_memory {
            state.checkpoints.pop_front();
        }
        self.lock_metrics().checkpoints_created += 1;

        debug!(
            session_id = %checkpoint.session_id,
            sequence = checkpoint.sequence,
            kind = %kind,
            "Created checkpoint"
        );
        Ok(checkpoint)
    }

    /// Writes a checkpoint of an active session.
    ///
    /// # Errors
    /// Returns `SessionError::SessionNotFound` or
    /// `SessionError::SessionTerminated` for sessions that are not active,
    /// and storage or serialization errors from the write.
    pub async fn create_checkpoint(&self, session_id: &str, kind: CheckpointKind) -> Result<Checkpoint> {
        let slot = self.active_slot(session_id).await?;
        let mut state = slot.lock().await;
        ensure_active(&state.session)?;
        self.write_checkpoint(&mut state, kind, Utc::now()).await
    }

    /// Restores a session from a checkpoint and reactivates it.
    ///
    /// Uses the in-memory checkpoint when available and the durable store
    /// otherwise, so sessions unknown to this process (after a restart) or
    /// already terminated can be restored too.
    ///
    /// # Arguments
    /// * `session_id` - Session to restore
    /// * `sequence` - Checkpoint sequence, `None` for the latest
    ///
    /// # Errors
    /// Returns `SessionError::CheckpointNotFound` if no checkpoint matches,
    /// `SessionError::SessionNotFound` if nothing is known about the
    /// session, and `SessionError::CapacityExceeded` when reactivating would
    /// exceed `max_sessions`.
    pub async fn restore_from_checkpoint(&self, session_id: &str, sequence: Option<u64>) -> Result<Session> {
        if let Some(slot) = self.slot(session_id).await {
            if let Some(session) = self.restore_attached(&slot, session_id, sequence).await? {
                return Ok(session);
            }
        }
        self.restore_detached(session_id, sequence).await
    }

    /// Restores a session that is still in the active table.
    ///
    /// Returns `None` if the slot's session ended in the meantime.
    async fn restore_attached(&self, slot: &Slot, session_id: &str, sequence: Option<u64>) -> Result<Option<Session>> {
        let mut state = slot.lock().await;
        if !state.session.is_active() {
            return Ok(None);
        }

        let in_memory = match sequence {
            Some(seq) => state.checkpoints.iter().rev().find(|c| c.sequence == seq).cloned(),
            None => state.checkpoints.back().cloned(),
        };
        let checkpoint = match in_memory {
            Some(checkpoint) => checkpoint,
            None => self.store.load_checkpoint(session_id, sequence).await?.ok_or_else(|| {
                SessionError::CheckpointNotFound { session_id: session_id.to_string(), sequence }
            })?,
        };

        state.session.restore(&checkpoint, Utc::now())?;
        self.store.upsert_session(&state.session).await?;
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
        state.timer = Some(self.arm_checkpoint_timer(session_id));

        self.lock_metrics().restored_sessions += 1;
        info!(session_id = %session_id, sequence = checkpoint.sequence, "Restored session from checkpoint");
        Ok(Some(state.session.clone()))
    }

    /// Restores a session that is not in the active table.
    async fn restore_detached(&self, session_id: &str, sequence: Option<u64>) -> Result<Session> {
        let Some(checkpoint) = self.store.load_checkpoint(session_id, sequence).await? else {
            // Distinguish an unknown session from a missing checkpoint.
            self.get_session(session_id).await?;
            return Err(SessionError::CheckpointNotFound { session_id: session_id.to_string(), sequence });
        };

        let now = Utc::now();
        let session = match self.store.load_session(session_id).await? {
            Some(mut stored) => {
                stored.restore(&checkpoint, now)?;
                stored
            }
            None => Session::from_checkpoint(&checkpoint, now)?,
        };
        let next_sequence = self.store.latest_checkpoint_sequence(session_id).await?.map_or(1, |seq| seq + 1);

        let slot = {
            let mut active = self.active.write().await;
            if let Some(existing) = active.get(session_id).cloned() {
                drop(active);
                return self
                    .restore_attached(&existing, session_id, sequence)
                    .await?
                    .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()));
            }
            if active.len() >= self.config.max_sessions {
                warn!(session_id = %session_id, max = self.config.max_sessions, "Restore refused at capacity");
                return Err(SessionError::CapacityExceeded { max: self.config.max_sessions });
            }
            let slot: Slot = Arc::new(Mutex::new(SlotState {
                session: session.clone(),
                checkpoints: VecDeque::from([checkpoint.clone()]),
                next_sequence,
                timer: Some(self.arm_checkpoint_timer(session_id)),
            }));
            active.insert(session_id.to_string(), Arc::clone(&slot));
            slot
        };

        if let Err(e) = self.store.upsert_session(&session).await {
            self.active.write().await.remove(session_id);
            if let Some(timer) = slot.lock().await.timer.take() {
                timer.cancel();
            }
            return Err(e.into());
        }

        self.lock_history().retain(|s| s.id != session_id);
        self.lock_metrics().restored_sessions += 1;
        info!(
            session_id = %session_id,
            sequence = checkpoint.sequence,
            next_sequence,
            "Restored session from durable checkpoint"
        );
        Ok(session)
    }

    /// Expires idle sessions and purges old history.
    ///
    /// # Returns
    /// The number of sessions expired.
    ///
    /// # Errors
    /// Individual failures are logged, not returned; the result is always
    /// `Ok` today but the signature leaves room for store-wide failures.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        self.cleanup_expired_at(Utc::now()).await
    }

    /// [`SessionManager::cleanup_expired`] as of `now`.
    ///
    /// # Errors
    /// See [`SessionManager::cleanup_expired`].
    pub async fn cleanup_expired_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now.checked_sub_signed(self.config.session_timeout()).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let slots: Vec<(String, Slot)> =
            self.active.read().await.iter().map(|(id, slot)| (id.clone(), Arc::clone(slot))).collect();

        let mut expired = 0;
        for (id, slot) in slots {
            let idle = {
                let state = slot.lock().await;
                state.session.is_active() && state.session.updated_at < cutoff
            };
            if !idle {
                continue;
            }
            match self.complete_at(&id, &SessionOutcome::timeout(), now, Some(cutoff)).await {
                Ok(Some(_)) => {
                    expired += 1;
                    info!(session_id = %id, "Session expired after inactivity");
                }
                Ok(None) | Err(SessionError::SessionTerminated { .. } | SessionError::SessionNotFound(_)) => {}
                Err(e) => warn!(session_id = %id, error = %e, "Failed to expire session"),
            }
        }

        if let Err(e) = self.purge_history_at(now).await {
            warn!(error = %e, "History purge failed");
        }
        if expired > 0 {
            info!(expired, "Cleanup sweep expired sessions");
        }
        Ok(expired)
    }

    /// Drops terminated sessions older than the retention window from
    /// memory and from the durable store.
    ///
    /// # Returns
    /// The number of sessions removed from the durable store.
    ///
    /// # Errors
    /// Returns a storage error if the durable purge fails.
    pub async fn purge_history(&self) -> Result<usize> {
        self.purge_history_at(Utc::now()).await
    }

    /// [`SessionManager::purge_history`] as of `now`.
    ///
    /// # Errors
    /// See [`SessionManager::purge_history`].
    pub async fn purge_history_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now.checked_sub_signed(self.config.history_retention()).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let in_memory = {
            let mut history = self.lock_history();
            let before = history.len();
            history.retain(|s| s.completed_at.is_none_or(|at| at >= cutoff));
            before - history.len()
        };
        let durable = self.store.purge_sessions_before(cutoff).await?;
        if in_memory > 0 || durable > 0 {
            info!(in_memory, durable, "Purged session history");
        }
        Ok(durable)
    }

    /// Current counters.
    pub async fn metrics(&self) -> SessionMetrics {
        let active = self.active.read().await.len();
        SessionMetrics { active_sessions: active, ..*self.lock_metrics() }
    }

    /// Ids of the active sessions.
    pub async fn active_session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Terminated sessions still held in memory, oldest first.
    pub fn history(&self) -> Vec<Session> {
        self.lock_history().iter().cloned().collect()
    }

    /// In-memory checkpoints of an active session, oldest first.
    ///
    /// # Errors
    /// Returns an error when the session is not active.
    pub async fn checkpoints(&self, session_id: &str) -> Result<Vec<Checkpoint>> {
        let slot = self.active_slot(session_id).await?;
        let state = slot.lock().await;
        Ok(state.checkpoints.iter().cloned().collect())
    }

    /// Get the durable store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Get the session configuration.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn arm_checkpoint_timer(&self, session_id: &str) -> CancellationToken {
        let token = self.shutdown.child_token();
        let stop = token.clone();
        let manager = self.this.clone();
        let period = self.config.checkpoint_interval();
        let id = session_id.to_string();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        match manager.create_checkpoint(&id, CheckpointKind::Periodic).await {
                            Ok(_) => {}
                            Err(SessionError::SessionNotFound(_) | SessionError::SessionTerminated { .. }) => break,
                            Err(e) => warn!(session_id = %id, error = %e, "Periodic checkpoint failed"),
                        }
                    }
                }
            }
            debug!(session_id = %id, "Checkpoint timer stopped");
        });
        token
    }

    /// Starts the recurring cleanup sweep. Calling it twice is a no-op.
    pub fn start_cleanup(&self) {
        let mut task = self.cleanup_task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }

        let stop = self.shutdown.child_token();
        let manager = self.this.clone();
        let period = self.config.cleanup_interval();
        *task = Some(tokio::spawn(async move {
            // Sweep time follows the runtime clock from a wall-clock anchor.
            let (anchor_wall, anchor) = (Utc::now(), Instant::now());
            let mut interval = tokio::time::interval_at(anchor + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    tick = interval.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        let elapsed = chrono::Duration::from_std(tick.saturating_duration_since(anchor))
                            .unwrap_or_else(|_| chrono::Duration::zero());
                        if let Err(e) = manager.cleanup_expired_at(anchor_wall + elapsed).await {
                            warn!(error = %e, "Cleanup sweep failed");
                        }
                    }
                }
            }
            debug!("Session cleanup sweep stopped");
        }));
        info!(interval_secs = period.as_secs(), "Started session cleanup sweep");
    }

    /// Writes a shutdown checkpoint per active session and stops all timers.
    pub async fn shutdown(&self) {
        let slots: Vec<(String, Slot)> =
            self.active.read().await.iter().map(|(id, slot)| (id.clone(), Arc::clone(slot))).collect();

        let mut flushed = 0;
        for (id, slot) in slots {
            let mut state = slot.lock().await;
            if let Some(timer) = state.timer.take() {
                timer.cancel();
            }
            if !state.session.is_active() {
                continue;
            }
            match self.write_checkpoint(&mut state, CheckpointKind::Shutdown, Utc::now()).await {
                Ok(_) => flushed += 1,
                Err(e) => error!(session_id = %id, error = %e, "Shutdown checkpoint failed"),
            }
        }

        self.shutdown.cancel();
        let cleanup = self.cleanup_task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = cleanup {
            if let Err(e) = handle.await {
                warn!(error = %e, "Cleanup task ended abnormally");
            }
        }
        info!(flushed, "Session manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use switchboard_core::models::{DecompositionRecord, ExecutionRecord, TurnOutcome};
    use switchboard_core::storage::SqliteSessionStore;

    fn store() -> Arc<SqliteSessionStore> {
        Arc::new(SqliteSessionStore::open_in_memory().unwrap())
    }

    fn manager_with(config: SessionConfig, store: Arc<SqliteSessionStore>) -> Arc<SessionManager> {
        SessionManager::new(config, store).unwrap()
    }

    fn manager() -> Arc<SessionManager> {
        manager_with(SessionConfig::default(), store())
    }

    fn one_turn(worker: &str, tokens: u64) -> SessionPatch {
        SessionPatch::turn(vec![TurnOutcome { worker_id: worker.into(), success: true, tokens, cost_usd: 0.01 }])
    }

    /// Delegates to SQLite but can be told to reject session upserts.
    struct RejectingStore {
        inner: SqliteSessionStore,
        reject: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl SessionStore for RejectingStore {
        async fn upsert_session(&self, session: &Session) -> switchboard_core::StorageResult<()> {
            if self.reject.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(StorageError::Inconsistent("disk full".to_string()));
            }
            self.inner.upsert_session(session).await
        }

        async fn load_session(&self, session_id: &str) -> switchboard_core::StorageResult<Option<Session>> {
            self.inner.load_session(session_id).await
        }

        async fn save_checkpoint(&self, session: &Session, checkpoint: &Checkpoint) -> switchboard_core::StorageResult<()> {
            self.inner.save_checkpoint(session, checkpoint).await
        }

        async fn load_checkpoint(
            &self,
            session_id: &str,
            sequence: Option<u64>,
        ) -> switchboard_core::StorageResult<Option<Checkpoint>> {
            self.inner.load_checkpoint(session_id, sequence).await
        }

        async fn latest_checkpoint_sequence(&self, session_id: &str) -> switchboard_core::StorageResult<Option<u64>> {
            self.inner.latest_checkpoint_sequence(session_id).await
        }

        async fn insert_execution(&self, record: &ExecutionRecord) -> switchboard_core::StorageResult<()> {
            self.inner.insert_execution(record).await
        }

        async fn list_executions(&self, session_id: &str) -> switchboard_core::StorageResult<Vec<ExecutionRecord>> {
            self.inner.list_executions(session_id).await
        }

        async fn insert_decomposition(&self, record: &DecompositionRecord) -> switchboard_core::StorageResult<()> {
            self.inner.insert_decomposition(record).await
        }

        async fn decompositions_for(
            &self,
            session_id: &str,
        ) -> switchboard_core::StorageResult<Vec<DecompositionRecord>> {
            self.inner.decompositions_for(session_id).await
        }

        async fn purge_sessions_before(&self, cutoff: DateTime<Utc>) -> switchboard_core::StorageResult<usize> {
            self.inner.purge_sessions_before(cutoff).await
        }

        async fn verify_integrity(&self) -> switchboard_core::StorageResult<()> {
            self.inner.verify_integrity().await
        }
    }

    #[tokio::test]
    async fn test_failed_create_releases_its_slot() {
        let store = Arc::new(RejectingStore {
            inner: SqliteSessionStore::open_in_memory().unwrap(),
            reject: std::sync::atomic::AtomicBool::new(true),
        });
        let config = SessionConfig { max_sessions: 1, ..SessionConfig::default() };
        let manager = SessionManager::new(config, Arc::clone(&store) as Arc<dyn SessionStore>).unwrap();

        let err = manager.create_session(NewSession::new("u", "p")).await.unwrap_err();
        assert!(matches!(err, SessionError::Storage(StorageError::Inconsistent(_))));
        assert!(manager.active_session_ids().await.is_empty());
        assert_eq!(manager.metrics().await.total_sessions, 0);

        store.reject.store(false, std::sync::atomic::Ordering::SeqCst);
        let session = manager.create_session(NewSession::new("u", "p")).await.unwrap();
        assert_eq!(manager.active_session_ids().await, vec![session.id]);
    }

    #[tokio::test]
    async fn test_capacity_of_one() {
        let manager = manager_with(SessionConfig { max_sessions: 1, ..SessionConfig::default() }, store());
        let first = manager.create_session(NewSession::new("u1", "first")).await.unwrap();

        let err = manager.create_session(NewSession::new("u2", "second")).await.unwrap_err();
        assert!(matches!(err, SessionError::CapacityExceeded { max: 1 }));

        manager.complete_session(&first.id, SessionOutcome::success()).await.unwrap();
        assert!(manager.create_session(NewSession::new("u2", "second")).await.is_ok());
    }

    #[tokio::test]
    async fn test_checkpoint_sequences_increase() {
        let store = store();
        let manager = manager_with(SessionConfig::default(), Arc::clone(&store));
        let session = manager.create_session(NewSession::new("u", "p")).await.unwrap();

        let mut sequences = Vec::new();
        for _ in 0..3 {
            sequences.push(manager.create_checkpoint(&session.id, CheckpointKind::Manual).await.unwrap().sequence);
        }
        assert_eq!(sequences, vec![1, 2, 3]);

        manager.complete_session(&session.id, SessionOutcome::success()).await.unwrap();
        let last = store.load_checkpoint(&session.id, None).await.unwrap().unwrap();
        assert_eq!(last.sequence, 4);
        assert_eq!(last.kind, CheckpointKind::Final);
        assert_eq!(manager.metrics().await.checkpoints_created, 4);
    }

    #[tokio::test]
    async fn test_in_memory_checkpoints_are_trimmed() {
        let config = SessionConfig { max_checkpoints_in_memory: 2, ..SessionConfig::default() };
        let manager = manager_with(config, store());
        let session = manager.create_session(NewSession::new("u", "p")).await.unwrap();
        for _ in 0..4 {
            manager.create_checkpoint(&session.id, CheckpointKind::Manual).await.unwrap();
        }
        let kept: Vec<u64> = manager.checkpoints(&session.id).await.unwrap().iter().map(|c| c.sequence).collect();
        assert_eq!(kept, vec![3, 4]);

        // Older checkpoints are still durable.
        let restored = manager.restore_from_checkpoint(&session.id, Some(1)).await.unwrap();
        assert_eq!(restored.turn, 0);
    }

    #[tokio::test]
    async fn test_restore_latest_checkpoint() {
        let manager = manager();
        let session = manager.create_session(NewSession::new("u", "p")).await.unwrap();

        manager.update_session(&session.id, one_turn("w1", 100)).await.unwrap();
        manager.create_checkpoint(&session.id, CheckpointKind::Manual).await.unwrap();
        manager.update_session(&session.id, one_turn("w2", 50)).await.unwrap();

        let restored = manager.restore_from_checkpoint(&session.id, None).await.unwrap();
        assert_eq!(restored.turn, 1);
        assert_eq!(restored.tokens_used, 100);
        assert!(restored.is_active());
        assert!(!restored.worker_state.contains_key("w2"));

        let err = manager.restore_from_checkpoint(&session.id, Some(99)).await.unwrap_err();
        assert!(matches!(err, SessionError::CheckpointNotFound { sequence: Some(99), .. }));
        assert_eq!(manager.metrics().await.restored_sessions, 1);
    }

    #[tokio::test]
    async fn test_timeout_sweep_fails_idle_sessions() {
        let manager = manager();
        let idle = manager.create_session(NewSession::new("u", "idle")).await.unwrap();

        assert_eq!(manager.cleanup_expired().await.unwrap(), 0);
        let later = Utc::now() + chrono::Duration::minutes(31);
        assert_eq!(manager.cleanup_expired_at(later).await.unwrap(), 1);

        let ended = manager.get_session(&idle.id).await.unwrap();
        assert_eq!(ended.status, SessionStatus::Failed);
        assert_eq!(ended.completion_reason.as_deref(), Some(SessionOutcome::TIMEOUT_REASON));

        let metrics = manager.metrics().await;
        assert_eq!(metrics.failed_sessions, 1);
        assert_eq!(metrics.active_sessions, 0);
    }

    #[tokio::test]
    async fn test_terminated_sessions_reject_updates() {
        let manager = manager();
        let session = manager.create_session(NewSession::new("u", "p")).await.unwrap();
        manager.complete_session(&session.id, SessionOutcome::failure("gave up")).await.unwrap();

        let err = manager.update_session(&session.id, one_turn("w", 1)).await.unwrap_err();
        assert!(matches!(err, SessionError::SessionTerminated { status: SessionStatus::Failed, .. }));
        let err = manager.complete_session(&session.id, SessionOutcome::success()).await.unwrap_err();
        assert!(matches!(err, SessionError::SessionTerminated { .. }));
        assert!(matches!(manager.get_session("missing").await, Err(SessionError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_restore_after_restart() {
        let store = store();
        let session_id = {
            let first = manager_with(SessionConfig::default(), Arc::clone(&store));
            let session = first.create_session(NewSession::new("u", "p").with_conversation("c1")).await.unwrap();
            first.update_session(&session.id, one_turn("w1", 42)).await.unwrap();
            first.create_checkpoint(&session.id, CheckpointKind::Manual).await.unwrap();
            first.shutdown().await;
            session.id
        };

        let second = manager_with(SessionConfig::default(), Arc::clone(&store));
        let restored = second.restore_from_checkpoint(&session_id, None).await.unwrap();
        assert_eq!(restored.turn, 1);
        assert_eq!(restored.tokens_used, 42);
        assert_eq!(restored.conversation_id.as_deref(), Some("c1"));

        // Sequence 1 is manual and 2 is the shutdown checkpoint.
        let next = second.create_checkpoint(&session_id, CheckpointKind::Manual).await.unwrap();
        assert_eq!(next.sequence, 3);

        let reused = second.get_or_create_session("u", Some("c1"), "again").await.unwrap();
        assert_eq!(reused.id, session_id);
    }

    #[tokio::test]
    async fn test_restore_unknown_session() {
        let manager = manager();
        let err = manager.restore_from_checkpoint("nope", None).await.unwrap_err();
        assert!(matches!(err, SessionError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_conversation_lookup_reuses_session() {
        let manager = manager();
        let a = manager.get_or_create_session("u", Some("conv"), "hi").await.unwrap();
        let b = manager.get_or_create_session("u", Some("conv"), "again").await.unwrap();
        let c = manager.get_or_create_session("other", Some("conv"), "hi").await.unwrap();
        let d = manager.get_or_create_session("u", None, "fresh").await.unwrap();
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_ne!(a.id, d.id);
        assert_eq!(manager.metrics().await.total_sessions, 3);
    }

    #[tokio::test]
    async fn test_history_purge() {
        let store = store();
        let manager = manager_with(SessionConfig::default(), Arc::clone(&store));
        let session = manager.create_session(NewSession::new("u", "p")).await.unwrap();
        manager.complete_session(&session.id, SessionOutcome::success()).await.unwrap();
        assert_eq!(manager.history().len(), 1);

        assert_eq!(manager.purge_history().await.unwrap(), 0);
        let removed = manager.purge_history_at(Utc::now() + chrono::Duration::days(2)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(manager.history().is_empty());
        assert!(matches!(manager.get_session(&session.id).await, Err(SessionError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_shutdown_writes_checkpoints() {
        let store = store();
        let manager = manager_with(SessionConfig::default(), Arc::clone(&store));
        let session = manager.create_session(NewSession::new("u", "p")).await.unwrap();
        manager.shutdown().await;

        let checkpoint = store.load_checkpoint(&session.id, None).await.unwrap().unwrap();
        assert_eq!(checkpoint.kind, CheckpointKind::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_checkpoint_timer() {
        let manager = manager();
        let session = manager.create_session(NewSession::new("u", "p")).await.unwrap();

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(manager.metrics().await.checkpoints_created, 1);

        manager.complete_session(&session.id, SessionOutcome::success()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;
        // Only the final checkpoint was added after completion.
        assert_eq!(manager.metrics().await.checkpoints_created, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_sweep_runs_on_interval() {
        let config = SessionConfig { session_timeout_secs: 1, cleanup_interval_secs: 5, ..SessionConfig::default() };
        let manager = manager_with(config, store());
        let session = manager.create_session(NewSession::new("u", "p")).await.unwrap();
        manager.start_cleanup();
        manager.start_cleanup();

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(manager.get_session(&session.id).await.unwrap().status, SessionStatus::Active);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(manager.get_session(&session.id).await.unwrap().status, SessionStatus::Failed);
        manager.shutdown().await;
    }
}
