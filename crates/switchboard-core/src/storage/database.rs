//! SQLite connection and schema for sessions, checkpoints and execution history.

use rusqlite::{Connection, Transaction};
use std::path::Path;
use tracing::{debug, warn};

use crate::storage::error::{StorageError, StorageResult};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    conversation_id TEXT,
    status TEXT NOT NULL,
    state_json TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT
);

-- append-only, one row per (session, sequence)
CREATE TABLE IF NOT EXISTS checkpoints (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    kind TEXT NOT NULL,
    created_at TEXT NOT NULL,
    session_state TEXT NOT NULL,
    plan_state TEXT NOT NULL,
    worker_state TEXT NOT NULL,
    turn INTEGER NOT NULL,
    tokens_used INTEGER NOT NULL,
    cost_usd REAL NOT NULL,
    UNIQUE (session_id, sequence)
);

CREATE TABLE IF NOT EXISTS execution_history (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    worker_id TEXT NOT NULL,
    prompt TEXT NOT NULL,
    success INTEGER NOT NULL,
    error TEXT,
    duration_ms INTEGER NOT NULL,
    prompt_tokens INTEGER NOT NULL,
    completion_tokens INTEGER NOT NULL,
    cost_usd REAL NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS decompositions (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    parent_request TEXT NOT NULL,
    subtasks TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_user_conversation ON sessions(user_id, conversation_id);
CREATE INDEX IF NOT EXISTS idx_sessions_status_completed ON sessions(status, completed_at);
CREATE INDEX IF NOT EXISTS idx_execution_history_session_id ON execution_history(session_id);
CREATE INDEX IF NOT EXISTS idx_decompositions_session_id ON decompositions(session_id);
"#;

/// Owns the SQLite connection backing a session store.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens (or creates) the database file at `path` and applies the schema.
    ///
    /// File databases run in WAL mode so readers of an older snapshot do not
    /// block checkpoint writes.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        let _mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        Self::with_connection(conn)
    }

    /// A private in-memory database, gone when dropped.
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StorageResult<Self> {
        conn.execute_batch(SCHEMA)?;
        debug!("Session schema ready");
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Runs `f` inside a transaction, committing on `Ok` and rolling back on `Err`.
    ///
    /// # Errors
    /// Whatever `f` returns, or `StorageError::Sqlite` if SQLite fails to
    /// begin, commit or roll back.
    pub fn transaction<F, R>(&mut self, f: F) -> StorageResult<R>
    where
        F: FnOnce(&Transaction) -> StorageResult<R>,
    {
        let tx = self.conn.transaction()?;
        let outcome = f(&tx);
        if outcome.is_ok() {
            tx.commit()?;
        } else {
            tx.rollback()?;
        }
        outcome
    }

    /// Runs `PRAGMA integrity_check`.
    ///
    /// # Errors
    /// * `StorageError::Integrity` - If SQLite reports any problem
    pub fn verify_integrity(&self) -> StorageResult<()> {
        let mut stmt = self.conn.prepare("PRAGMA integrity_check")?;
        let problems: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|line| line != "ok")
            .collect();

        if problems.is_empty() {
            Ok(())
        } else {
            warn!(problems = problems.len(), "Database integrity check failed");
            Err(StorageError::Integrity(problems.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables(db: &Database) -> Vec<String> {
        let mut stmt = db.conn().prepare("SELECT name FROM sqlite_master WHERE type='table'").unwrap();
        stmt.query_map([], |row| row.get(0)).unwrap().map(|r| r.unwrap()).collect()
    }

    #[test]
    fn test_schema_created_in_memory() {
        let db = Database::open_in_memory().unwrap();
        let tables = tables(&db);
        assert!(tables.contains(&"sessions".to_string()));
        assert!(tables.contains(&"checkpoints".to_string()));
        assert!(tables.contains(&"execution_history".to_string()));
        assert!(tables.contains(&"decompositions".to_string()));
    }

    #[test]
    fn test_reopening_file_keeps_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchboard.db");

        drop(Database::open(&path).unwrap());
        assert!(path.exists());

        let db = Database::open(&path).unwrap();
        assert_eq!(tables(&db).iter().filter(|t| !t.starts_with("sqlite_")).count(), 4);
    }

    #[test]
    fn test_failed_closure_rolls_back() {
        let mut db = Database::open_in_memory().unwrap();

        let result: StorageResult<()> = db.transaction(|tx| {
            tx.execute(
                "INSERT INTO sessions (id, user_id, status, state_json, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
                rusqlite::params!["s-1", "u", "active", "{}", "2026-01-01T00:00:00Z", "2026-01-01T00:00:00Z"],
            )?;
            Err(StorageError::Inconsistent("checkpoint for another session".to_string()))
        });
        assert!(result.is_err());

        let mut stmt = db.conn().prepare("SELECT id FROM sessions WHERE id = ?").unwrap();
        assert!(!stmt.exists(rusqlite::params!["s-1"]).unwrap());
    }

    #[test]
    fn test_verify_integrity_on_fresh_database() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.verify_integrity().is_ok());
    }
}
