//! Locks that outlive one invocation: resume and forced release.

use std::sync::Arc;

use adt_locksmith::connection::Connection;
use adt_locksmith::models::lock::{LockKey, LockRecord, ObjectKind};
use adt_locksmith::models::session::SessionMode;
use adt_locksmith::objects::ObjectRef;
use adt_locksmith::orchestrator::state::ChainStage;
use adt_locksmith::orchestrator::{ForceUnlockOutcome, Orchestrator};
use adt_locksmith::persistence::db;
use adt_locksmith::persistence::lock_registry::LockRegistry;
use adt_locksmith::AppError;

use super::test_helpers::{registry, Failure, FakeConnection, FakeOps, Op, HANDLE};

fn program() -> ObjectRef {
    ObjectRef::new(ObjectKind::Program, "zreport")
}

fn key() -> LockKey {
    LockKey::new(ObjectKind::Program, "ZREPORT", None)
}

#[tokio::test]
async fn later_invocation_resumes_recorded_lock() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("locks.db");
    let ops = FakeOps::new();

    // First invocation: lock and exit.
    {
        let registry = LockRegistry::new(Arc::new(db::connect(&path).await.expect("connect")));
        let conn = FakeConnection::new("shared-session");
        let mut first = Orchestrator::new(conn, ops.clone(), registry, program());
        first.lock().await.expect("lock");
    }

    // Second invocation: same session, fresh registry handle.
    let registry = LockRegistry::new(Arc::new(db::connect(&path).await.expect("reconnect")));
    let conn = FakeConnection::new("shared-session");
    let mut second = Orchestrator::new(Arc::clone(&conn), ops.clone(), registry.clone(), program());

    let handle = second.resume_lock().await.expect("resume");
    assert_eq!(handle, HANDLE);
    assert_eq!(second.stage(), ChainStage::Locked);
    assert_eq!(conn.session_mode(), SessionMode::Stateful);

    second.update("REPORT zreport.").await.expect("update");
    second.unlock().await.expect("unlock");
    assert!(registry.get(&key()).await.expect("get").is_none());
    assert_eq!(ops.count(Op::Lock), 1);
}

#[tokio::test]
async fn resume_without_record_is_not_found() {
    let registry = registry().await;
    let mut chain = Orchestrator::new(FakeConnection::new("s1"), FakeOps::new(), registry, program());
    let err = chain.resume_lock().await.expect_err("nothing recorded");
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn resume_of_another_sessions_lock_conflicts() {
    let registry = registry().await;
    registry
        .set_lock(&LockRecord::new(&key(), "owner", "H"))
        .await
        .expect("seed");

    let conn = FakeConnection::new("intruder");
    let mut chain = Orchestrator::new(Arc::clone(&conn), FakeOps::new(), registry, program());
    let err = chain.resume_lock().await.expect_err("other session");
    assert!(matches!(err, AppError::Conflict(ref msg) if msg.contains("owner")));
    assert_eq!(conn.session_mode(), SessionMode::Stateless);
}

#[tokio::test]
async fn write_under_resumed_lock_keeps_it_held() {
    let registry = registry().await;
    registry
        .set_lock(&LockRecord::new(&key(), "s1", HANDLE))
        .await
        .expect("seed");
    let ops = FakeOps::new();

    let mut chain = Orchestrator::new(FakeConnection::new("s1"), ops.clone(), registry.clone(), program());
    chain.run_write("REPORT zreport.").await.expect("write");

    assert_eq!(ops.ops(), vec![Op::CheckWithPayload, Op::Update]);
    assert!(registry.get(&key()).await.expect("get").is_some());
    assert_eq!(chain.lock_handle(), Some(HANDLE));
}

#[tokio::test]
async fn force_unlock_is_idempotent() {
    let registry = registry().await;
    let conn = FakeConnection::new("s1");
    let ops = FakeOps::new();
    let mut chain = Orchestrator::new(Arc::clone(&conn), ops.clone(), registry.clone(), program());
    chain.lock().await.expect("lock");

    assert_eq!(
        chain.force_unlock().await.expect("force"),
        ForceUnlockOutcome::Unlocked
    );
    assert!(registry.get(&key()).await.expect("get").is_none());
    assert_eq!(chain.lock_handle(), None);
    assert_eq!(conn.session_mode(), SessionMode::Stateless);

    assert_eq!(
        chain.force_unlock().await.expect("force again"),
        ForceUnlockOutcome::NothingHeld
    );
    assert_eq!(ops.count(Op::Unlock), 1);
}

#[tokio::test]
async fn force_unlock_clears_bookkeeping_even_when_remote_unlock_fails() {
    let registry = registry().await;
    registry
        .set_lock(&LockRecord::new(&key(), "crashed-session", "STALEHANDLE"))
        .await
        .expect("seed");
    let ops = FakeOps::new().fail(Op::Unlock, Failure::Status(404));
    let conn = FakeConnection::new("s1");

    let mut chain = Orchestrator::new(Arc::clone(&conn), ops.clone(), registry.clone(), program());
    let outcome = chain.force_unlock().await.expect("force");
    assert!(matches!(outcome, ForceUnlockOutcome::UnlockFailed(ref reason) if reason.contains("404")));

    let unlock = ops.calls().pop().expect("unlock attempted");
    assert_eq!(unlock.lock_handle.as_deref(), Some("STALEHANDLE"));
    assert_eq!(unlock.mode, SessionMode::Stateful);
    assert!(registry.get(&key()).await.expect("get").is_none());
    assert_eq!(conn.session_mode(), SessionMode::Stateless);
}

#[tokio::test]
async fn force_unlock_after_conflict_keeps_the_owners_record() {
    let registry = registry().await;
    registry
        .set_lock(&LockRecord::new(&key(), "s1", "OWNERHANDLE"))
        .await
        .expect("seed");
    let ops = FakeOps::new().fail(Op::Unlock, Failure::Network);
    let conn = FakeConnection::new("s2");

    let mut chain = Orchestrator::new(Arc::clone(&conn), ops.clone(), registry.clone(), program());
    let err = chain.lock().await.expect_err("conflict");
    assert!(matches!(err, AppError::Conflict(_)));
    assert_eq!(chain.lock_handle(), Some(HANDLE));

    ops.heal(Op::Unlock);
    assert_eq!(
        chain.force_unlock().await.expect("force"),
        ForceUnlockOutcome::Unlocked
    );

    let unlock = ops.calls().pop().expect("unlock attempted");
    assert_eq!(unlock.lock_handle.as_deref(), Some(HANDLE));
    let owner = registry.get(&key()).await.expect("get").expect("owner record");
    assert_eq!(owner.session_id, "s1");
    assert_eq!(owner.lock_handle, "OWNERHANDLE");
    assert_eq!(chain.lock_handle(), None);
    assert_eq!(conn.session_mode(), SessionMode::Stateless);
}

#[tokio::test]
async fn force_unlock_leaves_a_record_rewritten_by_another_session() {
    let registry = registry().await;
    let ops = FakeOps::new();
    let conn = FakeConnection::new("s2");

    let mut chain = Orchestrator::new(Arc::clone(&conn), ops.clone(), registry.clone(), program());
    chain.lock().await.expect("lock");
    registry.remove(&key()).await.expect("forget");
    registry
        .set_lock(&LockRecord::new(&key(), "s1", "NEWERHANDLE"))
        .await
        .expect("other session records");

    assert_eq!(
        chain.force_unlock().await.expect("force"),
        ForceUnlockOutcome::Unlocked
    );
    let record = registry.get(&key()).await.expect("get").expect("kept");
    assert_eq!(record.session_id, "s1");
}
