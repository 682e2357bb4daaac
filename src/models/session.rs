//! Session model and lifecycle helpers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Transport routing mode for a connection.
///
/// `Stateful` pins requests to the backend instance that owns the
/// server-side session (and therefore the lock); `Stateless` lets the
/// transport route freely.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Sticky routing with session cookies and CSRF token.
    Stateful,
    /// Free routing; no backend affinity.
    #[default]
    Stateless,
}

impl SessionMode {
    /// Header value understood by the remote server.
    #[must_use]
    pub fn as_header_value(self) -> &'static str {
        match self {
            Self::Stateful => "stateful",
            Self::Stateless => "stateless",
        }
    }
}

/// One authenticated conversation with the remote server, persisted in the
/// session store so later invocations can reuse it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Session {
    /// Caller- or process-generated identifier.
    pub session_id: String,
    /// Opaque `Cookie` header value sent with every request.
    #[serde(default)]
    pub cookies: String,
    /// CSRF token for mutating requests, once fetched.
    #[serde(default)]
    pub csrf_token: Option<String>,
    /// Cookie name to value, kept for inspection.
    #[serde(default)]
    pub cookie_store: BTreeMap<String, String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last persisted mutation.
    pub updated_at: DateTime<Utc>,
    /// Process that created the session.
    pub owner_pid: u32,
}

impl Session {
    /// Construct an empty session owned by the current process.
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            cookies: String::new(),
            csrf_token: None,
            cookie_store: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            owner_pid: std::process::id(),
        }
    }

    /// Generate a fresh random session identifier.
    #[must_use]
    pub fn generate_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Merge a single `Set-Cookie` header value into the cookie jar.
    ///
    /// Only the leading `name=value` pair is kept; attributes such as
    /// `path` or `HttpOnly` are dropped. Returns `true` when the jar changed.
    pub fn merge_set_cookie(&mut self, header: &str) -> bool {
        let pair = header.split(';').next().unwrap_or_default().trim();
        let Some((name, value)) = pair.split_once('=') else {
            return false;
        };
        let name = name.trim();
        if name.is_empty() {
            return false;
        }
        let value = value.trim();
        if self.cookie_store.get(name).map(String::as_str) == Some(value) {
            return false;
        }
        self.cookie_store.insert(name.to_owned(), value.to_owned());
        self.cookies = self.render_cookie_header();
        true
    }

    /// Replace the CSRF token. Returns `true` when it changed.
    pub fn set_csrf_token(&mut self, token: Option<String>) -> bool {
        if self.csrf_token == token {
            return false;
        }
        self.csrf_token = token;
        true
    }

    /// Drop all cookies and the CSRF token.
    pub fn clear_credentials(&mut self) {
        self.cookies.clear();
        self.cookie_store.clear();
        self.csrf_token = None;
    }

    /// Age of the session relative to `now`, in milliseconds.
    #[must_use]
    pub fn age_millis(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_milliseconds()
    }

    fn render_cookie_header(&self) -> String {
        self.cookie_store
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Lightweight view of a session used by the sweeper and inspection tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionMetadata {
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Process that created the session.
    pub owner_pid: u32,
    /// Age at the time the metadata was read.
    pub age_millis: i64,
}
