//! Per-object-kind collaborator contract.
//!
//! The [`ObjectOperations`] trait decouples the orchestrator from the
//! request builders of each object kind. The orchestrator only sequences
//! these calls; it never inspects the kind itself.

pub mod adt;

use std::fmt::{Display, Formatter};
use std::time::Duration;

use crate::connection::{BoxFuture, Connection, RemoteResponse};
use crate::models::lock::{normalize_name, LockKey, ObjectKind};

/// Identity of one remote object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    /// Object kind.
    pub kind: ObjectKind,
    /// Normalized object name.
    pub name: String,
    /// Normalized parent container, for kinds unique only within a parent.
    pub sub_key: Option<String>,
    /// Package the object belongs to (used on create).
    pub package: Option<String>,
    /// Short description (used on create).
    pub description: Option<String>,
}

impl ObjectRef {
    /// Reference an object by kind and name.
    #[must_use]
    pub fn new(kind: ObjectKind, name: &str) -> Self {
        Self {
            kind,
            name: normalize_name(name),
            sub_key: None,
            package: None,
            description: None,
        }
    }

    /// Set the parent container name.
    #[must_use]
    pub fn with_sub_key(mut self, sub_key: Option<&str>) -> Self {
        self.sub_key = sub_key.map(normalize_name).filter(|s| !s.is_empty());
        self
    }

    /// Set the package.
    #[must_use]
    pub fn with_package(mut self, package: Option<&str>) -> Self {
        self.package = package.map(normalize_name);
        self
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: Option<&str>) -> Self {
        self.description = description.map(str::to_owned);
        self
    }

    /// Lock registry key for this object.
    #[must_use]
    pub fn key(&self) -> LockKey {
        LockKey::new(self.kind, &self.name, self.sub_key.as_deref())
    }
}

impl Display for ObjectRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Object version targeted by a syntax check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckVersion {
    /// The inactive (edited, not yet activated) version.
    Inactive,
    /// The active version.
    Active,
}

impl CheckVersion {
    /// Wire value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
        }
    }
}

/// Tagged result for calls where a non-2xx answer is an expected outcome
/// rather than a failure (e.g. validation reporting "already exists").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The server accepted the request.
    Ok(RemoteResponse),
    /// The server answered with an expected alternate outcome.
    Alternate {
        /// Server-provided reason.
        reason: String,
        /// Raw response.
        response: RemoteResponse,
    },
}

impl Outcome {
    /// Underlying response in either case.
    #[must_use]
    pub fn response(&self) -> &RemoteResponse {
        match self {
            Self::Ok(response) | Self::Alternate { response, .. } => response,
        }
    }

    /// Whether the outcome is [`Outcome::Ok`].
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }
}

/// The eight edit-lifecycle operations (plus a consistency read) exposed by
/// every supported object kind.
///
/// Every method takes the connection, the object identity and, where
/// relevant, a payload and lock handle. Failures carry the remote status in
/// [`AppError::RemoteRejected`](crate::AppError::RemoteRejected).
pub trait ObjectOperations: Send + Sync {
    /// Check that the object name/kind may be created.
    fn validate<'a>(
        &'a self,
        conn: &'a dyn Connection,
        object: &'a ObjectRef,
    ) -> BoxFuture<'a, Outcome>;

    /// Create the object shell.
    fn create<'a>(
        &'a self,
        conn: &'a dyn Connection,
        object: &'a ObjectRef,
        payload: Option<&'a str>,
    ) -> BoxFuture<'a, RemoteResponse>;

    /// Run a syntax check, optionally against unsaved source.
    fn check_syntax<'a>(
        &'a self,
        conn: &'a dyn Connection,
        object: &'a ObjectRef,
        version: CheckVersion,
        payload: Option<&'a str>,
    ) -> BoxFuture<'a, RemoteResponse>;

    /// Acquire the exclusive edit lock and return its handle.
    fn acquire_lock<'a>(
        &'a self,
        conn: &'a dyn Connection,
        object: &'a ObjectRef,
    ) -> BoxFuture<'a, String>;

    /// Write new source under a held lock.
    fn update<'a>(
        &'a self,
        conn: &'a dyn Connection,
        object: &'a ObjectRef,
        lock_handle: &'a str,
        payload: &'a str,
    ) -> BoxFuture<'a, RemoteResponse>;

    /// Release a held lock.
    fn unlock<'a>(
        &'a self,
        conn: &'a dyn Connection,
        object: &'a ObjectRef,
        lock_handle: &'a str,
    ) -> BoxFuture<'a, RemoteResponse>;

    /// Activate the inactive version.
    fn activate<'a>(
        &'a self,
        conn: &'a dyn Connection,
        object: &'a ObjectRef,
    ) -> BoxFuture<'a, RemoteResponse>;

    /// Delete the object, passing the held lock handle if any.
    fn delete<'a>(
        &'a self,
        conn: &'a dyn Connection,
        object: &'a ObjectRef,
        lock_handle: Option<&'a str>,
    ) -> BoxFuture<'a, RemoteResponse>;

    /// Read the object. With `wait_for_consistency`, keep polling until the
    /// object is visible or the budget is spent.
    fn read<'a>(
        &'a self,
        conn: &'a dyn Connection,
        object: &'a ObjectRef,
        wait_for_consistency: Option<Duration>,
    ) -> BoxFuture<'a, RemoteResponse>;
}
