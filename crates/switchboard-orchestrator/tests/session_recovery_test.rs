//! Session recovery across a process restart backed by an on-disk store.

use chrono::Utc;
use std::sync::Arc;

use switchboard_core::models::{CheckpointKind, NewSession, SessionOutcome, SessionPatch, SessionStatus, TurnOutcome};
use switchboard_core::storage::SqliteSessionStore;
use switchboard_orchestrator::{SessionConfig, SessionError, SessionManager};

fn turn(worker: &str, tokens: u64) -> SessionPatch {
    SessionPatch::turn(vec![TurnOutcome { worker_id: worker.into(), success: true, tokens, cost_usd: 0.002 }])
}

#[tokio::test]
async fn test_restore_after_reopening_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sessions.db");

    let session_id = {
        let store = Arc::new(SqliteSessionStore::open(&path).unwrap());
        let manager = SessionManager::new(SessionConfig::default(), store).unwrap();
        let session = manager.create_session(NewSession::new("user-1", "plan the rollout")).await.unwrap();
        manager.update_session(&session.id, turn("planner", 120)).await.unwrap();
        manager.create_checkpoint(&session.id, CheckpointKind::Manual).await.unwrap();
        manager.update_session(&session.id, turn("reviewer", 80)).await.unwrap();
        manager.shutdown().await;
        session.id
    };

    let store = Arc::new(SqliteSessionStore::open(&path).unwrap());
    let manager = SessionManager::new(SessionConfig::default(), store).unwrap();

    // The shutdown checkpoint carries both turns.
    let latest = manager.restore_from_checkpoint(&session_id, None).await.unwrap();
    assert_eq!(latest.turn, 2);
    assert_eq!(latest.tokens_used, 200);
    assert_eq!(latest.status, SessionStatus::Active);

    let earlier = manager.restore_from_checkpoint(&session_id, Some(1)).await.unwrap();
    assert_eq!(earlier.turn, 1);
    assert!(!earlier.worker_state.contains_key("reviewer"));

    let next = manager.create_checkpoint(&session_id, CheckpointKind::Manual).await.unwrap();
    assert_eq!(next.sequence, 3);
}

#[tokio::test]
async fn test_terminated_session_can_be_restored() {
    let store = Arc::new(SqliteSessionStore::open_in_memory().unwrap());
    let manager = SessionManager::new(SessionConfig::default(), store).unwrap();

    let session = manager.create_session(NewSession::new("user-2", "summarize")).await.unwrap();
    manager.update_session(&session.id, turn("summarizer", 40)).await.unwrap();
    manager.complete_session(&session.id, SessionOutcome::failure("worker crashed")).await.unwrap();
    assert!(manager.history().iter().any(|s| s.id == session.id));

    let restored = manager.restore_from_checkpoint(&session.id, None).await.unwrap();
    assert!(restored.is_active());
    assert_eq!(restored.turn, 1);
    assert!(restored.completed_at.is_none());
    assert!(manager.history().is_empty());
    assert_eq!(manager.metrics().await.restored_sessions, 1);
}

#[tokio::test]
async fn test_expired_sessions_stay_restorable_until_purged() {
    let store = Arc::new(SqliteSessionStore::open_in_memory().unwrap());
    let manager = SessionManager::new(SessionConfig::default(), store).unwrap();
    let session = manager.create_session(NewSession::new("user-3", "idle")).await.unwrap();

    let later = Utc::now() + chrono::Duration::hours(1);
    assert_eq!(manager.cleanup_expired_at(later).await.unwrap(), 1);
    assert_eq!(manager.get_session(&session.id).await.unwrap().status, SessionStatus::Failed);

    manager.purge_history_at(Utc::now() + chrono::Duration::days(3)).await.unwrap();
    let err = manager.restore_from_checkpoint(&session.id, None).await.unwrap_err();
    assert!(matches!(err, SessionError::SessionNotFound(_)));
}
