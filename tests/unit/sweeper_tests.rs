use std::sync::Arc;

use chrono::{Duration, Utc};

use adt_locksmith::models::lock::{LockKey, LockRecord, ObjectKind};
use adt_locksmith::models::session::Session;
use adt_locksmith::persistence::db;
use adt_locksmith::persistence::lock_registry::LockRegistry;
use adt_locksmith::persistence::session_store::SessionStore;
use adt_locksmith::persistence::sweeper::Sweeper;
use adt_locksmith::process::{self, Liveness};

/// Far above any real `pid_max`, so the OS reports "no such process".
const DEAD_PID: u32 = 999_999_999;

struct Fixture {
    _dir: tempfile::TempDir,
    store: SessionStore,
    registry: LockRegistry,
    sweeper: Sweeper,
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SessionStore::new(dir.path().join("sessions"));
    let registry = LockRegistry::new(Arc::new(db::connect_memory().await.expect("db")));
    let sweeper = Sweeper::new(store.clone(), registry.clone(), Duration::minutes(30));
    Fixture {
        _dir: dir,
        store,
        registry,
        sweeper,
    }
}

fn session_aged(id: &str, age: Duration, owner_pid: u32) -> Session {
    let mut session = Session::new(id);
    session.created_at = Utc::now() - age;
    session.updated_at = session.created_at;
    session.owner_pid = owner_pid;
    session
}

fn lock_aged(name: &str, session_id: &str, age: Duration) -> LockRecord {
    let mut record = LockRecord::new(&LockKey::new(ObjectKind::Class, name, None), session_id, "H");
    record.acquired_at = Utc::now() - age;
    record
}

#[tokio::test]
async fn stale_sessions_are_removed_fresh_ones_kept() {
    let f = fixture().await;
    let me = std::process::id();
    f.store
        .save(&session_aged("old", Duration::hours(2), me))
        .expect("save old");
    f.store
        .save(&session_aged("fresh", Duration::minutes(1), me))
        .expect("save fresh");

    let removed = f.sweeper.sweep_stale_sessions().expect("sweep");
    assert_eq!(removed, vec!["old"]);
    assert_eq!(f.store.list().expect("list"), vec!["fresh"]);
}

#[tokio::test]
async fn sessions_of_dead_processes_are_removed() {
    let f = fixture().await;
    f.store
        .save(&session_aged("orphan", Duration::minutes(1), DEAD_PID))
        .expect("save orphan");
    f.store
        .save(&session_aged("mine", Duration::minutes(1), std::process::id()))
        .expect("save mine");

    let removed = f.sweeper.sweep_dead_process_sessions().expect("sweep");
    assert_eq!(removed, vec!["orphan"]);
    assert_eq!(f.store.list().expect("list"), vec!["mine"]);
}

#[tokio::test]
async fn inconclusive_probe_keeps_the_session() {
    let f = fixture().await;
    let sweeper = f.sweeper.clone().with_probe(|_| Liveness::Inconclusive);
    f.store
        .save(&session_aged("unknown", Duration::minutes(1), DEAD_PID))
        .expect("save");

    assert!(sweeper.sweep_dead_process_sessions().expect("sweep").is_empty());
    assert_eq!(f.store.list().expect("list"), vec!["unknown"]);
}

#[tokio::test]
async fn corrupt_session_is_skipped() {
    let f = fixture().await;
    f.store
        .save(&session_aged("old", Duration::hours(2), std::process::id()))
        .expect("save");
    std::fs::write(f.store.dir().join("broken.json"), "{").expect("write corrupt");

    let removed = f.sweeper.sweep_stale_sessions().expect("sweep");
    assert_eq!(removed, vec!["old"]);
    assert_eq!(f.store.list().expect("list"), vec!["broken"]);
}

#[tokio::test]
async fn stale_locks_are_forgotten() {
    let f = fixture().await;
    f.registry
        .set_lock(&lock_aged("zcl_old", "s1", Duration::hours(1)))
        .await
        .expect("set old");
    f.registry
        .set_lock(&lock_aged("zcl_new", "s1", Duration::minutes(5)))
        .await
        .expect("set new");

    let removed = f.sweeper.sweep_stale_locks().await.expect("sweep");
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].object_name, "ZCL_OLD");
    assert_eq!(f.registry.list_locks().await.expect("list").len(), 1);
}

#[tokio::test]
async fn locks_of_missing_sessions_are_forgotten() {
    let f = fixture().await;
    f.store.create("alive", false).expect("create session");
    f.registry
        .set_lock(&lock_aged("zcl_kept", "alive", Duration::minutes(1)))
        .await
        .expect("set kept");
    f.registry
        .set_lock(&lock_aged("zcl_orphan", "gone", Duration::minutes(1)))
        .await
        .expect("set orphan");

    let removed = f.sweeper.sweep_orphaned_locks().await.expect("sweep");
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].session_id, "gone");
}

#[tokio::test]
async fn sweep_all_reports_every_category() {
    let f = fixture().await;
    let sweeper = f.sweeper.clone().with_probe(|pid| {
        if pid == DEAD_PID {
            Liveness::Dead
        } else {
            Liveness::Alive
        }
    });
    f.store
        .save(&session_aged("dead", Duration::minutes(1), DEAD_PID))
        .expect("save dead");
    f.store
        .save(&session_aged("old", Duration::hours(3), std::process::id()))
        .expect("save old");
    f.registry
        .set_lock(&lock_aged("zcl_stale", "someone", Duration::hours(2)))
        .await
        .expect("set stale");
    f.registry
        .set_lock(&lock_aged("zcl_of_dead", "dead", Duration::minutes(1)))
        .await
        .expect("set orphan");

    let report = sweeper.sweep_all().await.expect("sweep all");
    assert_eq!(report.dead_sessions, vec!["dead"]);
    assert_eq!(report.stale_sessions, vec!["old"]);
    assert_eq!(report.stale_locks.len(), 1);
    assert_eq!(report.orphaned_locks.len(), 1);
    assert_eq!(report.orphaned_locks[0].object_name, "ZCL_OF_DEAD");
    assert_eq!(report.total(), 4);
    assert!(f.registry.list_locks().await.expect("list").is_empty());
}

#[test]
fn probe_reports_this_process_alive_and_missing_pid_dead() {
    #[cfg(unix)]
    {
        assert_eq!(process::probe(std::process::id()), Liveness::Alive);
        assert_eq!(process::probe(DEAD_PID), Liveness::Dead);
    }
    assert_eq!(process::probe(0), Liveness::Inconclusive);
}
