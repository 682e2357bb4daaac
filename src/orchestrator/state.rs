//! Chain stage machine and accumulated step results.

use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};

use crate::connection::RemoteResponse;
use crate::{AppError, Result};

/// Operations the orchestrator can perform on one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    /// Name/kind validation.
    Validate,
    /// Object shell creation.
    Create,
    /// Syntax check (inactive, with payload, or final).
    Check,
    /// Lock acquisition.
    Lock,
    /// Source write under lock.
    Update,
    /// Lock release.
    Unlock,
    /// Activation.
    Activate,
    /// Deletion.
    Delete,
    /// Read, optionally waiting for consistency.
    Read,
}

impl Step {
    /// Stable lower-case name used in logs and error messages.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Create => "create",
            Self::Check => "check",
            Self::Lock => "lock",
            Self::Update => "update",
            Self::Unlock => "unlock",
            Self::Activate => "activate",
            Self::Delete => "delete",
            Self::Read => "read",
        }
    }
}

impl Display for Step {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of an orchestrator within its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChainStage {
    /// Nothing done yet.
    #[default]
    Init,
    /// Validation passed.
    Validated,
    /// Object shell created.
    Created,
    /// Inactive version checked after create.
    CheckedInactive,
    /// Lock held.
    Locked,
    /// New source checked under lock.
    CheckedWithPayload,
    /// Source written.
    Updated,
    /// Lock released.
    Unlocked,
    /// Final check after unlock completed.
    CheckedFinal,
    /// Activated.
    Activated,
    /// Pre-deletion check completed.
    CheckedDeletion,
    /// Object deleted.
    Deleted,
    /// Chain finished.
    Done,
}

impl ChainStage {
    /// Stage reached by performing `step` from this stage.
    ///
    /// `Read` is allowed anywhere and does not advance the stage.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` if `step` is out of order.
    pub fn transition(self, step: Step) -> Result<Self> {
        use ChainStage as S;

        let next = match (self, step) {
            (stage, Step::Read) => stage,
            (S::Init, Step::Validate) => S::Validated,
            (S::Validated, Step::Create) => S::Created,
            (S::Created, Step::Check) => S::CheckedInactive,
            (S::Init | S::CheckedInactive, Step::Lock) => S::Locked,
            (S::Locked, Step::Check) => S::CheckedWithPayload,
            (S::Locked | S::CheckedWithPayload, Step::Update) => S::Updated,
            (S::Locked | S::CheckedWithPayload | S::Updated, Step::Unlock) => S::Unlocked,
            (S::Unlocked, Step::Check) => S::CheckedFinal,
            (S::Init | S::Unlocked | S::CheckedFinal, Step::Activate) => S::Activated,
            (S::Init, Step::Check) => S::CheckedDeletion,
            (S::Init | S::CheckedDeletion, Step::Delete) => S::Deleted,
            (stage, step) => {
                return Err(AppError::InvalidState(format!(
                    "{step} is not allowed at stage {stage:?}"
                )))
            }
        };
        Ok(next)
    }

    /// Whether a chain may be marked finished from this stage.
    #[must_use]
    pub fn can_finish(self) -> bool {
        matches!(
            self,
            Self::Unlocked | Self::CheckedFinal | Self::Activated | Self::Deleted
        )
    }
}

/// A step that failed, kept for diagnostics.
#[derive(Debug, Clone)]
pub struct StepFailure {
    /// Step that failed.
    pub step: Step,
    /// Rendered error.
    pub error: String,
    /// When the failure was recorded.
    pub timestamp: DateTime<Utc>,
}

/// Results accumulated by one orchestrator run.
#[derive(Debug, Clone, Default)]
pub struct ChainState {
    /// Validation answer.
    pub validation_response: Option<RemoteResponse>,
    /// Create answer.
    pub create_result: Option<RemoteResponse>,
    /// Handle of the lock currently held, if any.
    pub lock_handle: Option<String>,
    /// Update answer.
    pub update_result: Option<RemoteResponse>,
    /// Most recent syntax check answer.
    pub check_result: Option<RemoteResponse>,
    /// Unlock answer.
    pub unlock_result: Option<RemoteResponse>,
    /// Activation answer.
    pub activate_result: Option<RemoteResponse>,
    /// Delete answer.
    pub delete_result: Option<RemoteResponse>,
    /// Most recent read answer.
    pub read_result: Option<RemoteResponse>,
    /// Failed steps in order.
    pub failures: Vec<StepFailure>,
    /// Non-fatal problems (tolerated read timeouts, failed compensation).
    pub warnings: Vec<String>,
}

impl ChainState {
    pub(crate) fn record_failure(&mut self, step: Step, err: &AppError) {
        self.failures.push(StepFailure {
            step,
            error: err.to_string(),
            timestamp: Utc::now(),
        });
    }
}
