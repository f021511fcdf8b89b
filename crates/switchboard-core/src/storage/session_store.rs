//! Durable session store.
//!
//! Sessions are upserted by id. Checkpoints and execution history are
//! append-only. All records are JSON or RFC 3339 text so a restarted process
//! can read everything back without in-memory state.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{OptionalExtension, Row, params};
use std::fmt;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::models::{Checkpoint, CheckpointKind, DecompositionRecord, ExecutionRecord, Session};
use crate::storage::database::Database;
use crate::storage::error::{StorageError, StorageResult};

/// Persistence contract used by the session manager and the orchestrator.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Inserts or replaces a session record.
    async fn upsert_session(&self, session: &Session) -> StorageResult<()>;

    /// Loads a session by id.
    async fn load_session(&self, session_id: &str) -> StorageResult<Option<Session>>;

    /// Upserts the session and appends the checkpoint in one transaction.
    async fn save_checkpoint(&self, session: &Session, checkpoint: &Checkpoint) -> StorageResult<()>;

    /// Loads the checkpoint with `sequence`, or the latest when `None`.
    async fn load_checkpoint(&self, session_id: &str, sequence: Option<u64>) -> StorageResult<Option<Checkpoint>>;

    /// Highest checkpoint sequence written for the session.
    async fn latest_checkpoint_sequence(&self, session_id: &str) -> StorageResult<Option<u64>>;

    /// Appends an execution record.
    async fn insert_execution(&self, record: &ExecutionRecord) -> StorageResult<()>;

    /// Execution history of a session, oldest first.
    async fn list_executions(&self, session_id: &str) -> StorageResult<Vec<ExecutionRecord>>;

    /// Appends a task decomposition record.
    async fn insert_decomposition(&self, record: &DecompositionRecord) -> StorageResult<()>;

    /// Decompositions recorded for a session, oldest first.
    async fn decompositions_for(&self, session_id: &str) -> StorageResult<Vec<DecompositionRecord>>;

    /// Deletes terminated sessions completed before `cutoff`, with their
    /// checkpoints, history and decompositions.
    ///
    /// # Returns
    /// The number of sessions removed.
    async fn purge_sessions_before(&self, cutoff: DateTime<Utc>) -> StorageResult<usize>;

    /// Verifies the store's physical integrity.
    async fn verify_integrity(&self) -> StorageResult<()>;
}

/// SQLite-backed [`SessionStore`].
pub struct SqliteSessionStore {
    db: Mutex<Database>,
}

impl fmt::Debug for SqliteSessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteSessionStore").finish_non_exhaustive()
    }
}

impl SqliteSessionStore {
    /// Opens (or creates) a store at `path`.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let db = Database::open(path)?;
        info!(path = %path.display(), "Opened session store");
        Ok(Self { db: Mutex::new(db) })
    }

    /// Opens a store backed by an in-memory database.
    ///
    /// # Errors
    /// Returns an error if the database cannot be created.
    pub fn open_in_memory() -> StorageResult<Self> {
        Ok(Self { db: Mutex::new(Database::open_in_memory()?) })
    }
}

fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn upsert_session_row(conn: &rusqlite::Connection, session: &Session) -> StorageResult<()> {
    let state_json = serde_json::to_string(session)?;
    conn.execute(
        r#"
        INSERT INTO sessions (id, user_id, conversation_id, status, state_json, created_at, updated_at, completed_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(id) DO UPDATE SET
            user_id = excluded.user_id,
            conversation_id = excluded.conversation_id,
            status = excluded.status,
            state_json = excluded.state_json,
            updated_at = excluded.updated_at,
            completed_at = excluded.completed_at
        "#,
        params![
            session.id,
            session.user_id,
            session.conversation_id,
            session.status.as_str(),
            state_json,
            timestamp(&session.created_at),
            timestamp(&session.updated_at),
            session.completed_at.as_ref().map(timestamp),
        ],
    )?;
    Ok(())
}

// ============================================================================
// Row Parsing Helpers
// ============================================================================

fn parse_json_field<T>(row: &Row, idx: usize, column_name: &str) -> rusqlite::Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let json_str: String = row.get(idx)?;
    serde_json::from_str(&json_str).map_err(|_| {
        rusqlite::Error::InvalidColumnType(idx, column_name.to_string(), rusqlite::types::Type::Text)
    })
}

fn parse_timestamp(row: &Row, idx: usize, column_name: &str) -> rusqlite::Result<DateTime<Utc>> {
    let timestamp_str: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&timestamp_str).map(|dt| dt.with_timezone(&Utc)).map_err(|_| {
        rusqlite::Error::InvalidColumnType(idx, column_name.to_string(), rusqlite::types::Type::Text)
    })
}

fn row_to_checkpoint(row: &Row) -> rusqlite::Result<Checkpoint> {
    let kind: String = row.get(3)?;
    let kind = kind.parse::<CheckpointKind>().map_err(|_| {
        rusqlite::Error::InvalidColumnType(3, "kind".to_string(), rusqlite::types::Type::Text)
    })?;

    Ok(Checkpoint {
        id: row.get(0)?,
        session_id: row.get(1)?,
        sequence: row.get::<_, i64>(2)? as u64,
        kind,
        created_at: parse_timestamp(row, 4, "created_at")?,
        session_state: parse_json_field(row, 5, "session_state")?,
        plan_state: parse_json_field(row, 6, "plan_state")?,
        worker_state: parse_json_field(row, 7, "worker_state")?,
        turn: row.get::<_, i64>(8)? as u32,
        tokens_used: row.get::<_, i64>(9)? as u64,
        cost_usd: row.get(10)?,
    })
}

fn row_to_execution(row: &Row) -> rusqlite::Result<ExecutionRecord> {
    Ok(ExecutionRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        worker_id: row.get(2)?,
        prompt: row.get(3)?,
        success: row.get(4)?,
        error: row.get(5)?,
        duration_ms: row.get::<_, i64>(6)? as u64,
        prompt_tokens: row.get::<_, i64>(7)? as u64,
        completion_tokens: row.get::<_, i64>(8)? as u64,
        cost_usd: row.get(9)?,
        created_at: parse_timestamp(row, 10, "created_at")?,
    })
}

fn row_to_decomposition(row: &Row) -> rusqlite::Result<DecompositionRecord> {
    Ok(DecompositionRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        parent_request: row.get(2)?,
        subtasks: parse_json_field(row, 3, "subtasks")?,
        created_at: parse_timestamp(row, 4, "created_at")?,
    })
}

const CHECKPOINT_COLUMNS: &str = "id, session_id, sequence, kind, created_at, session_state, plan_state, \
     worker_state, turn, tokens_used, cost_usd";

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn upsert_session(&self, session: &Session) -> StorageResult<()> {
        let db = self.db.lock().await;
        upsert_session_row(db.conn(), session)?;
        debug!(session_id = %session.id, status = %session.status, "Upserted session");
        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> StorageResult<Option<Session>> {
        let db = self.db.lock().await;
        let state_json: Option<String> = db
            .conn()
            .query_row("SELECT state_json FROM sessions WHERE id = ?1", params![session_id], |row| row.get(0))
            .optional()?;

        state_json.map(|json| serde_json::from_str(&json).map_err(StorageError::from)).transpose()
    }

    async fn save_checkpoint(&self, session: &Session, checkpoint: &Checkpoint) -> StorageResult<()> {
        if checkpoint.session_id != session.id {
            return Err(StorageError::Inconsistent(format!(
                "checkpoint {} belongs to session {}, not {}",
                checkpoint.id, checkpoint.session_id, session.id
            )));
        }

        let session_state = serde_json::to_string(&checkpoint.session_state)?;
        let plan_state = serde_json::to_string(&checkpoint.plan_state)?;
        let worker_state = serde_json::to_string(&checkpoint.worker_state)?;

        let mut db = self.db.lock().await;
        db.transaction(|tx| {
            upsert_session_row(tx, session)?;
            tx.execute(
                &format!(
                    "INSERT INTO checkpoints ({CHECKPOINT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    checkpoint.id,
                    checkpoint.session_id,
                    checkpoint.sequence as i64,
                    checkpoint.kind.as_str(),
                    timestamp(&checkpoint.created_at),
                    session_state,
                    plan_state,
                    worker_state,
                    i64::from(checkpoint.turn),
                    checkpoint.tokens_used as i64,
                    checkpoint.cost_usd,
                ],
            )?;
            Ok(())
        })?;

        debug!(
            session_id = %checkpoint.session_id,
            sequence = checkpoint.sequence,
            kind = %checkpoint.kind,
            "Persisted checkpoint"
        );
        Ok(())
    }

    async fn load_checkpoint(&self, session_id: &str, sequence: Option<u64>) -> StorageResult<Option<Checkpoint>> {
        let db = self.db.lock().await;
        let checkpoint = match sequence {
            Some(seq) => db
                .conn()
                .query_row(
                    &format!("SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE session_id = ?1 AND sequence = ?2"),
                    params![session_id, seq as i64],
                    row_to_checkpoint,
                )
                .optional()?,
            None => db
                .conn()
                .query_row(
                    &format!(
                        "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE session_id = ?1 ORDER BY sequence DESC LIMIT 1"
                    ),
                    params![session_id],
                    row_to_checkpoint,
                )
                .optional()?,
        };
        Ok(checkpoint)
    }

    async fn latest_checkpoint_sequence(&self, session_id: &str) -> StorageResult<Option<u64>> {
        let db = self.db.lock().await;
        let max: Option<i64> = db.conn().query_row(
            "SELECT MAX(sequence) FROM checkpoints WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(max.map(|seq| seq as u64))
    }

    async fn insert_execution(&self, record: &ExecutionRecord) -> StorageResult<()> {
        let db = self.db.lock().await;
        db.conn().execute(
            r#"
            INSERT INTO execution_history
                (id, session_id, worker_id, prompt, success, error, duration_ms, prompt_tokens, completion_tokens, cost_usd, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                record.id,
                record.session_id,
                record.worker_id,
                record.prompt,
                record.success,
                record.error,
                record.duration_ms as i64,
                record.prompt_tokens as i64,
                record.completion_tokens as i64,
                record.cost_usd,
                timestamp(&record.created_at),
            ],
        )?;
        Ok(())
    }

    async fn list_executions(&self, session_id: &str) -> StorageResult<Vec<ExecutionRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.conn().prepare(
            r#"
            SELECT id, session_id, worker_id, prompt, success, error, duration_ms, prompt_tokens, completion_tokens, cost_usd, created_at
            FROM execution_history WHERE session_id = ?1 ORDER BY created_at, rowid
            "#,
        )?;
        let records = stmt.query_map(params![session_id], row_to_execution)?.collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    async fn insert_decomposition(&self, record: &DecompositionRecord) -> StorageResult<()> {
        let subtasks = serde_json::to_string(&record.subtasks)?;
        let db = self.db.lock().await;
        db.conn().execute(
            "INSERT INTO decompositions (id, session_id, parent_request, subtasks, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![record.id, record.session_id, record.parent_request, subtasks, timestamp(&record.created_at)],
        )?;
        debug!(session_id = %record.session_id, subtasks = record.subtasks.len(), "Recorded decomposition");
        Ok(())
    }

    async fn decompositions_for(&self, session_id: &str) -> StorageResult<Vec<DecompositionRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.conn().prepare(
            "SELECT id, session_id, parent_request, subtasks, created_at FROM decompositions \
             WHERE session_id = ?1 ORDER BY created_at, rowid",
        )?;
        let records = stmt.query_map(params![session_id], row_to_decomposition)?.collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    async fn purge_sessions_before(&self, cutoff: DateTime<Utc>) -> StorageResult<usize> {
        let cutoff = timestamp(&cutoff);
        let mut db = self.db.lock().await;
        let removed = db.transaction(|tx| {
            let filter = "SELECT id FROM sessions WHERE status != 'active' AND completed_at IS NOT NULL AND completed_at < ?1";
            tx.execute(&format!("DELETE FROM checkpoints WHERE session_id IN ({filter})"), params![cutoff])?;
            tx.execute(&format!("DELETE FROM execution_history WHERE session_id IN ({filter})"), params![cutoff])?;
            tx.execute(&format!("DELETE FROM decompositions WHERE session_id IN ({filter})"), params![cutoff])?;
            let removed = tx.execute(
                "DELETE FROM sessions WHERE status != 'active' AND completed_at IS NOT NULL AND completed_at < ?1",
                params![cutoff],
            )?;
            Ok(removed)
        })?;

        if removed > 0 {
            info!(removed, "Purged terminated sessions from store");
        }
        Ok(removed)
    }

    async fn verify_integrity(&self) -> StorageResult<()> {
        self.db.lock().await.verify_integrity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewSession, SessionOutcome, SessionPatch, Subtask, TurnOutcome};

    fn session() -> Session {
        Session::new(NewSession::new("user-1", "index the repo").with_conversation("conv-1"), Utc::now())
    }

    #[tokio::test]
    async fn test_upsert_and_load_session() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        let mut session = session();
        store.upsert_session(&session).await.unwrap();

        session.apply(
            SessionPatch::turn(vec![TurnOutcome { worker_id: "w".into(), success: true, tokens: 7, cost_usd: 0.1 }]),
            Utc::now(),
        );
        store.upsert_session(&session).await.unwrap();

        let loaded = store.load_session(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded, session);
        assert!(store.load_session("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_checkpoints_load_latest_or_by_sequence() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        let mut session = session();

        for seq in 1..=3 {
            session.apply(SessionPatch::turn(Vec::new()), Utc::now());
            let checkpoint = session.capture(seq, CheckpointKind::Periodic, Utc::now()).unwrap();
            store.save_checkpoint(&session, &checkpoint).await.unwrap();
        }

        assert_eq!(store.latest_checkpoint_sequence(&session.id).await.unwrap(), Some(3));
        let latest = store.load_checkpoint(&session.id, None).await.unwrap().unwrap();
        assert_eq!(latest.sequence, 3);
        assert_eq!(latest.turn, 3);

        let first = store.load_checkpoint(&session.id, Some(1)).await.unwrap().unwrap();
        assert_eq!(first.turn, 1);
        assert!(store.load_checkpoint(&session.id, Some(9)).await.unwrap().is_none());
        assert_eq!(store.latest_checkpoint_sequence("other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicate_sequence_rejected() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        let session = session();
        let first = session.capture(1, CheckpointKind::Manual, Utc::now()).unwrap();
        let dup = session.capture(1, CheckpointKind::Manual, Utc::now()).unwrap();
        store.save_checkpoint(&session, &first).await.unwrap();
        assert!(matches!(store.save_checkpoint(&session, &dup).await, Err(StorageError::Sqlite(_))));
    }

    #[tokio::test]
    async fn test_execution_history_round_trip() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        let mut record = ExecutionRecord::new("s-1", "worker-a", "hello");
        record.success = false;
        record.error = Some("backend timeout".into());
        store.insert_execution(&record).await.unwrap();
        store.insert_execution(&ExecutionRecord::new("s-1", "worker-b", "again")).await.unwrap();

        let history = store.list_executions("s-1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].error.as_deref(), Some("backend timeout"));
        assert!(history[1].success);
    }

    #[tokio::test]
    async fn test_purge_only_removes_old_terminated_sessions() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        let long_ago = Utc::now() - chrono::Duration::days(10);

        let mut old = session();
        old.finish(&SessionOutcome::success(), long_ago);
        let checkpoint = old.capture(1, CheckpointKind::Final, long_ago).unwrap();
        store.save_checkpoint(&old, &checkpoint).await.unwrap();
        store
            .insert_decomposition(&DecompositionRecord::new(&old.id, "index the repo", vec![Subtask::new("scan")]))
            .await
            .unwrap();

        let active = session();
        store.upsert_session(&active).await.unwrap();

        let removed = store.purge_sessions_before(Utc::now() - chrono::Duration::days(1)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.load_session(&old.id).await.unwrap().is_none());
        assert!(store.load_checkpoint(&old.id, None).await.unwrap().is_none());
        assert!(store.decompositions_for(&old.id).await.unwrap().is_empty());
        assert!(store.load_session(&active.id).await.unwrap().is_some());
        store.verify_integrity().await.unwrap();
    }
}
