#![forbid(unsafe_code)]

//! `adt-locksmith` — lock-safe edit chains against an ABAP Development Tools
//! server.
//!
//! Persists server sessions across invocations, tracks which session holds
//! which object lock, and sequences create/update/delete chains so that a
//! failure never leaves a lock the tool has forgotten about.

pub mod config;
pub mod connection;
pub mod errors;
pub mod logging;
pub mod models;
pub mod objects;
pub mod orchestrator;
pub mod persistence;
pub mod process;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
