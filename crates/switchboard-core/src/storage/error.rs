//! Storage errors.

use thiserror::Error;

/// Failures of the durable session store.
#[derive(Error, Debug)]
pub enum StorageError {
    /// SQLite rejected a statement or the connection failed.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A session, checkpoint slice or execution record failed to (de)serialize.
    #[error("Record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// A write referenced records that do not belong together.
    #[error("Inconsistent record: {0}")]
    Inconsistent(String),

    /// `PRAGMA integrity_check` reported problems.
    #[error("Integrity check failed: {0}")]
    Integrity(String),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
