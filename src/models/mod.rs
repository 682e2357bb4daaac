//! Domain model module declarations.

pub mod lock;
pub mod session;
