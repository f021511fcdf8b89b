//! Storage layer.
//!
//! Durable persistence for sessions, checkpoints and execution history on
//! SQLite. Schema migration tooling is out of scope; the schema is created
//! idempotently on open.

// SQL strings don't need hash-less raw strings
#![allow(clippy::needless_raw_string_hashes)]

pub mod database;
pub mod error;
pub mod session_store;

pub use database::Database;
pub use error::{StorageError, StorageResult};
pub use session_store::{SessionStore, SqliteSessionStore};
