//! Connection abstraction and session-mode switch.
//!
//! A [`Connection`] carries a mutable [`SessionMode`]. The orchestrator, not
//! the connection, decides when to flip it: stateful from lock acquisition
//! until a successful unlock, stateless otherwise.

pub mod http;

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::models::session::SessionMode;
use crate::Result;

/// Boxed future returned by connection and collaborator calls.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// HTTP verbs used by the remote protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// `GET`
    Get,
    /// `POST`
    Post,
    /// `PUT`
    Put,
    /// `DELETE`
    Delete,
}

impl HttpMethod {
    /// Whether the server requires a CSRF token for this verb.
    #[must_use]
    pub fn is_mutating(self) -> bool {
        !matches!(self, Self::Get)
    }
}

/// One request to the remote server, relative to the connection base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSpec {
    /// Verb.
    pub method: HttpMethod,
    /// Absolute path, e.g. `/sap/bc/adt/oo/classes/zcl_test`.
    pub path: String,
    /// Query parameters, appended in order.
    pub query: Vec<(String, String)>,
    /// Extra request headers.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Option<String>,
    /// Per-request timeout overriding the connection default.
    pub timeout: Option<Duration>,
}

impl RequestSpec {
    /// Start a request for `method` and `path`.
    #[must_use]
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    /// Append a query parameter.
    #[must_use]
    pub fn query(mut self, name: &str, value: impl Into<String>) -> Self {
        self.query.push((name.to_owned(), value.into()));
        self
    }

    /// Append a header.
    #[must_use]
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_owned(), value.into()));
        self
    }

    /// Set the body and its content type.
    #[must_use]
    pub fn body(mut self, content_type: &str, body: impl Into<String>) -> Self {
        self.headers
            .push(("Content-Type".to_owned(), content_type.to_owned()));
        self.body = Some(body.into());
        self
    }

    /// Override the timeout for this request.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Response from the remote server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers, lower-cased names; repeated headers keep the last value.
    pub headers: BTreeMap<String, String>,
    /// Response body.
    pub data: String,
}

impl RemoteResponse {
    /// Whether the status is 2xx.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Header lookup by case-insensitive name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Transport bound to one persisted session.
pub trait Connection: Send + Sync {
    /// Issue a request.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::RemoteRejected`](crate::AppError::RemoteRejected)
    /// for non-2xx responses and [`AppError::Network`](crate::AppError::Network)
    /// when no response was received (including timeouts).
    fn make_request(&self, request: RequestSpec) -> BoxFuture<'_, RemoteResponse>;

    /// Identifier of the session this connection is bound to.
    fn session_id(&self) -> &str;

    /// Current routing mode.
    fn session_mode(&self) -> SessionMode;

    /// Switch the routing mode for subsequent requests.
    fn set_session_mode(&self, mode: SessionMode);

    /// Drop cookies and CSRF token, return to stateless, and persist the
    /// cleared session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the cleared session cannot be saved.
    fn reset(&self) -> BoxFuture<'_, ()>;
}
