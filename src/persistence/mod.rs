//! Persistence layer modules.
//!
//! Sessions live in a directory keyspace (one JSON file per session id);
//! lock bookkeeping lives in a small `SQLite` database so concurrent
//! invocations resolve ownership atomically.

pub mod db;
pub mod lock_registry;
pub mod schema;
pub mod session_store;
pub mod sweeper;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;
