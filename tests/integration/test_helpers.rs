//! Shared fakes for orchestrator integration tests.
//!
//! `FakeConnection` tracks the session mode; `FakeOps` answers every
//! lifecycle call from a script and logs each call together with the mode
//! the connection was in when it was made.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use adt_locksmith::connection::{BoxFuture, Connection, RemoteResponse, RequestSpec};
use adt_locksmith::models::session::SessionMode;
use adt_locksmith::objects::{CheckVersion, ObjectOperations, ObjectRef, Outcome};
use adt_locksmith::persistence::db;
use adt_locksmith::persistence::lock_registry::LockRegistry;
use adt_locksmith::AppError;

/// Handle returned by every successful fake lock.
pub const HANDLE: &str = "LOCKHANDLE0123456789";

/// Connection that only tracks its session mode.
pub struct FakeConnection {
    session_id: String,
    stateful: AtomicBool,
}

impl FakeConnection {
    pub fn new(session_id: &str) -> Arc<Self> {
        Arc::new(Self {
            session_id: session_id.to_owned(),
            stateful: AtomicBool::new(false),
        })
    }
}

impl Connection for FakeConnection {
    fn make_request(&self, _request: RequestSpec) -> BoxFuture<'_, RemoteResponse> {
        Box::pin(async { Ok(ok_response()) })
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn session_mode(&self) -> SessionMode {
        if self.stateful.load(Ordering::SeqCst) {
            SessionMode::Stateful
        } else {
            SessionMode::Stateless
        }
    }

    fn set_session_mode(&self, mode: SessionMode) {
        self.stateful
            .store(mode == SessionMode::Stateful, Ordering::SeqCst);
    }

    fn reset(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.set_session_mode(SessionMode::Stateless);
            Ok(())
        })
    }
}

/// Collaborator call, as seen by the fake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Validate,
    Create,
    /// Check without a payload.
    Check,
    /// Check of new source under lock.
    CheckWithPayload,
    Lock,
    Update,
    Unlock,
    Activate,
    Delete,
    Read,
}

/// Scripted failure for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Answer with this HTTP status.
    Status(u16),
    /// No response.
    Network,
    /// Never answer within any reasonable time.
    Hang,
}

/// One logged call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: Op,
    pub mode: SessionMode,
    pub version: Option<CheckVersion>,
    pub lock_handle: Option<String>,
}

#[derive(Default)]
struct Script {
    failures: HashMap<Op, Failure>,
    alternate_validation: Option<String>,
    calls: Vec<Call>,
}

/// Scripted `ObjectOperations`. Clones share the script and call log.
#[derive(Clone, Default)]
pub struct FakeOps {
    script: Arc<Mutex<Script>>,
}

impl FakeOps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call of `op` fail.
    pub fn fail(self, op: Op, failure: Failure) -> Self {
        self.script.lock().unwrap().failures.insert(op, failure);
        self
    }

    /// Stop failing `op`.
    pub fn heal(&self, op: Op) {
        self.script.lock().unwrap().failures.remove(&op);
    }

    /// Answer validation with an alternate outcome.
    pub fn validation_alternate(self, reason: &str) -> Self {
        self.script.lock().unwrap().alternate_validation = Some(reason.to_owned());
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.script.lock().unwrap().calls.clone()
    }

    pub fn ops(&self) -> Vec<Op> {
        self.calls().into_iter().map(|call| call.op).collect()
    }

    pub fn count(&self, op: Op) -> usize {
        self.calls().iter().filter(|call| call.op == op).count()
    }

    fn record(
        &self,
        conn: &dyn Connection,
        op: Op,
        version: Option<CheckVersion>,
        lock_handle: Option<&str>,
    ) -> Option<Failure> {
        let mut script = self.script.lock().unwrap();
        script.calls.push(Call {
            op,
            mode: conn.session_mode(),
            version,
            lock_handle: lock_handle.map(str::to_owned),
        });
        script.failures.get(&op).copied()
    }

    fn answer<'a, T: Send + 'a>(
        &self,
        failure: Option<Failure>,
        value: T,
    ) -> BoxFuture<'a, T> {
        Box::pin(async move {
            match failure {
                None => Ok(value),
                Some(Failure::Status(status)) => Err(AppError::RemoteRejected {
                    status,
                    body: format!("scripted {status}"),
                }),
                Some(Failure::Network) => Err(AppError::Network("scripted timeout".into())),
                Some(Failure::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(value)
                }
            }
        })
    }
}

impl ObjectOperations for FakeOps {
    fn validate<'a>(&'a self, conn: &'a dyn Connection, _object: &'a ObjectRef) -> BoxFuture<'a, Outcome> {
        let failure = self.record(conn, Op::Validate, None, None);
        let outcome = match self.script.lock().unwrap().alternate_validation.clone() {
            Some(reason) => Outcome::Alternate {
                reason,
                response: RemoteResponse {
                    status: 400,
                    ..RemoteResponse::default()
                },
            },
            None => Outcome::Ok(ok_response()),
        };
        self.answer(failure, outcome)
    }

    fn create<'a>(
        &'a self,
        conn: &'a dyn Connection,
        _object: &'a ObjectRef,
        _payload: Option<&'a str>,
    ) -> BoxFuture<'a, RemoteResponse> {
        let failure = self.record(conn, Op::Create, None, None);
        self.answer(failure, ok_response())
    }

    fn check_syntax<'a>(
        &'a self,
        conn: &'a dyn Connection,
        _object: &'a ObjectRef,
        version: CheckVersion,
        payload: Option<&'a str>,
    ) -> BoxFuture<'a, RemoteResponse> {
        let op = if payload.is_some() {
            Op::CheckWithPayload
        } else {
            Op::Check
        };
        let failure = self.record(conn, op, Some(version), None);
        self.answer(failure, ok_response())
    }

    fn acquire_lock<'a>(&'a self, conn: &'a dyn Connection, _object: &'a ObjectRef) -> BoxFuture<'a, String> {
        let failure = self.record(conn, Op::Lock, None, None);
        self.answer(failure, HANDLE.to_owned())
    }

    fn update<'a>(
        &'a self,
        conn: &'a dyn Connection,
        _object: &'a ObjectRef,
        lock_handle: &'a str,
        _payload: &'a str,
    ) -> BoxFuture<'a, RemoteResponse> {
        let failure = self.record(conn, Op::Update, None, Some(lock_handle));
        self.answer(failure, ok_response())
    }

    fn unlock<'a>(
        &'a self,
        conn: &'a dyn Connection,
        _object: &'a ObjectRef,
        lock_handle: &'a str,
    ) -> BoxFuture<'a, RemoteResponse> {
        let failure = self.record(conn, Op::Unlock, None, Some(lock_handle));
        self.answer(failure, ok_response())
    }

    fn activate<'a>(&'a self, conn: &'a dyn Connection, _object: &'a ObjectRef) -> BoxFuture<'a, RemoteResponse> {
        let failure = self.record(conn, Op::Activate, None, None);
        self.answer(failure, ok_response())
    }

    fn delete<'a>(
        &'a self,
        conn: &'a dyn Connection,
        _object: &'a ObjectRef,
        lock_handle: Option<&'a str>,
    ) -> BoxFuture<'a, RemoteResponse> {
        let failure = self.record(conn, Op::Delete, None, lock_handle);
        self.answer(failure, ok_response())
    }

    fn read<'a>(
        &'a self,
        conn: &'a dyn Connection,
        _object: &'a ObjectRef,
        _wait_for_consistency: Option<Duration>,
    ) -> BoxFuture<'a, RemoteResponse> {
        let failure = self.record(conn, Op::Read, None, None);
        self.answer(failure, ok_response())
    }
}

pub fn ok_response() -> RemoteResponse {
    RemoteResponse {
        status: 200,
        ..RemoteResponse::default()
    }
}

pub async fn registry() -> LockRegistry {
    LockRegistry::new(Arc::new(db::connect_memory().await.expect("in-memory db")))
}
