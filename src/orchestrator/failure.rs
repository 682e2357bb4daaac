//! Chain abort wrapper.

use std::fmt::{Display, Formatter};

use crate::models::lock::truncate_handle;
use crate::AppError;

use super::state::Step;

/// Why and where an operation chain stopped.
///
/// `cause` is the error of the failing step, unchanged; compensation
/// problems are logged and never replace it.
#[derive(Debug)]
pub struct ChainFailure {
    /// Step that failed.
    pub step: Step,
    /// Original error.
    pub cause: AppError,
    /// Lock handle still held after compensation, if unlock did not succeed.
    pub held_lock: Option<String>,
    /// Session the chain ran in.
    pub session_id: String,
    /// Rendered object key.
    pub object: String,
}

impl Display for ChainFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} failed for {} (session {}; ",
            self.step, self.object, self.session_id
        )?;
        match &self.held_lock {
            Some(handle) => write!(f, "lock still held: {}", truncate_handle(handle))?,
            None => f.write_str("no lock held")?,
        }
        write!(f, "): {}", self.cause)
    }
}

impl From<ChainFailure> for AppError {
    fn from(failure: ChainFailure) -> Self {
        Self::Chain(Box::new(failure))
    }
}
