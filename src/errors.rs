//! Error types shared across the application.

use std::fmt::{Display, Formatter};

use crate::orchestrator::failure::ChainFailure;

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Record encoding or decoding failure.
    Serde(String),
    /// Requested session or lock record does not exist.
    NotFound(String),
    /// A session with the requested identifier already exists.
    AlreadyExists(String),
    /// Lock bookkeeping for the key belongs to a different session.
    Conflict(String),
    /// The remote server answered with a non-2xx status.
    RemoteRejected {
        /// HTTP status code returned by the server.
        status: u16,
        /// Response body, as returned.
        body: String,
    },
    /// No response was received; server-side state is unknown.
    Network(String),
    /// A best-effort cleanup failed. Logged, never returned in place of
    /// the error that triggered the cleanup.
    CompensationFailed(String),
    /// A chain step was requested out of protocol order.
    InvalidState(String),
    /// An operation chain aborted at a specific step.
    Chain(Box<ChainFailure>),
}

impl AppError {
    /// Remote HTTP status carried by this error, if any.
    ///
    /// Looks through [`AppError::Chain`] to the underlying cause.
    #[must_use]
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::RemoteRejected { status, .. } => Some(*status),
            Self::Chain(failure) => failure.cause.http_status(),
            _ => None,
        }
    }

    /// Whether the error means the server state is unknown (no response).
    #[must_use]
    pub fn is_network(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Chain(failure) => failure.cause.is_network(),
            _ => false,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Serde(msg) => write!(f, "serde: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::AlreadyExists(msg) => write!(f, "already exists: {msg}"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::RemoteRejected { status, body } => {
                write!(f, "remote rejected: status {status}")?;
                let body = body.trim();
                if !body.is_empty() {
                    write!(f, ": {}", truncate(body, 200))?;
                }
                Ok(())
            }
            Self::Network(msg) => write!(f, "network (no response, remote state unknown): {msg}"),
            Self::CompensationFailed(msg) => write!(f, "compensation failed: {msg}"),
            Self::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Self::Chain(failure) => write!(f, "{failure}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serde(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            Self::RemoteRejected {
                status: status.as_u16(),
                body: String::new(),
            }
        } else {
            Self::Network(err.to_string())
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_owned()
    } else {
        let head: String = text.chars().take(max_chars).collect();
        format!("{head}…")
    }
}
