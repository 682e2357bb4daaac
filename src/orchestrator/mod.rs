//! Operation-chain orchestrator.
//!
//! Sequences the lifecycle calls for one object against a [`Connection`],
//! keeps the lock registry in step with the remote lock, and compensates on
//! failure. The orchestrator never looks at the object kind; everything
//! kind-specific lives behind [`ObjectOperations`].
//!
//! Session mode rule: the connection is stateful from just before a lock
//! request until that lock is successfully released, and stateless on every
//! other exit path.

pub mod failure;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug_span, error, info, info_span, warn, Instrument};

use crate::config::GlobalConfig;
use crate::connection::{BoxFuture, Connection, RemoteResponse};
use crate::models::lock::{truncate_handle, LockRecord};
use crate::models::session::SessionMode;
use crate::objects::{CheckVersion, ObjectOperations, ObjectRef, Outcome};
use crate::persistence::lock_registry::LockRegistry;
use crate::{AppError, Result};

use self::failure::ChainFailure;
use self::state::{ChainStage, ChainState, Step};

/// Evaluate a step; on error, compensate and return the wrapped failure.
macro_rules! attempt {
    ($this:ident, $step:expr, $call:expr) => {
        match $call {
            Ok(value) => value,
            Err(err) => return Err($this.abort($step, err).await),
        }
    };
}

/// Callback invoked with the lock handle right after a lock is recorded.
pub type LockHook = Box<dyn Fn(&str) + Send + Sync>;

/// Chain behaviour switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainOptions {
    /// Activate after a successful update.
    pub activate: bool,
    /// Delete a created object when the create chain fails.
    pub delete_on_failure: bool,
    /// Long-poll budget for consistency reads.
    pub consistency_timeout: Duration,
    /// Upper bound for each remote step; exceeding it is a `Network` error.
    pub step_timeout: Option<Duration>,
}

impl Default for ChainOptions {
    fn default() -> Self {
        Self {
            activate: true,
            delete_on_failure: false,
            consistency_timeout: Duration::from_secs(30),
            step_timeout: None,
        }
    }
}

impl ChainOptions {
    /// Options taken from the `[chain]` configuration section.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self {
            activate: config.chain.activate,
            delete_on_failure: config.chain.delete_on_failure,
            consistency_timeout: config.consistency_timeout(),
            step_timeout: None,
        }
    }
}

/// Result of [`Orchestrator::force_unlock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForceUnlockOutcome {
    /// No handle in memory and no record in the registry.
    NothingHeld,
    /// The remote unlock succeeded.
    Unlocked,
    /// The remote unlock failed; local state was cleared anyway.
    UnlockFailed(String),
}

/// Drives one object through a create, update, or delete chain.
pub struct Orchestrator<C: Connection, O: ObjectOperations> {
    conn: Arc<C>,
    ops: O,
    registry: LockRegistry,
    object: ObjectRef,
    options: ChainOptions,
    on_lock: Option<LockHook>,
    stage: ChainStage,
    state: ChainState,
    created: bool,
}

impl<C: Connection, O: ObjectOperations> Orchestrator<C, O> {
    /// Orchestrator for `object` with default options.
    #[must_use]
    pub fn new(conn: Arc<C>, ops: O, registry: LockRegistry, object: ObjectRef) -> Self {
        Self {
            conn,
            ops,
            registry,
            object,
            options: ChainOptions::default(),
            on_lock: None,
            stage: ChainStage::Init,
            state: ChainState::default(),
            created: false,
        }
    }

    /// Replace the chain options.
    #[must_use]
    pub fn with_options(mut self, options: ChainOptions) -> Self {
        self.options = options;
        self
    }

    /// Register a callback run with the handle as soon as a lock is recorded.
    #[must_use]
    pub fn on_lock(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_lock = Some(Box::new(hook));
        self
    }

    /// Current stage.
    #[must_use]
    pub fn stage(&self) -> ChainStage {
        self.stage
    }

    /// Accumulated results.
    #[must_use]
    pub fn state(&self) -> &ChainState {
        &self.state
    }

    /// Object this orchestrator works on.
    #[must_use]
    pub fn object(&self) -> &ObjectRef {
        &self.object
    }

    /// Handle of the lock currently held, if any.
    #[must_use]
    pub fn lock_handle(&self) -> Option<&str> {
        self.state.lock_handle.as_deref()
    }

    // ─── Steps ───────────────────────────────────────────────

    /// Ask whether the object may be created.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` out of order, or the remote error.
    pub async fn validate(&mut self) -> Result<Outcome> {
        let next = self.stage.transition(Step::Validate)?;
        let outcome = guarded(
            Step::Validate,
            self.options.step_timeout,
            self.ops.validate(self.conn.as_ref(), &self.object),
        )
        .await?;
        self.state.validation_response = Some(outcome.response().clone());
        self.stage = next;
        Ok(outcome)
    }

    /// Create the object shell.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` out of order, or the remote error.
    pub async fn create(&mut self, payload: Option<&str>) -> Result<RemoteResponse> {
        let next = self.stage.transition(Step::Create)?;
        let response = guarded(
            Step::Create,
            self.options.step_timeout,
            self.ops.create(self.conn.as_ref(), &self.object, payload),
        )
        .await?;
        self.created = true;
        self.state.create_result = Some(response.clone());
        self.stage = next;
        Ok(response)
    }

    /// Syntax check. Before any other step this checks the active version
    /// (pre-deletion); afterwards the inactive one, with `payload` if given.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` out of order, or the remote error.
    pub async fn check(&mut self, payload: Option<&str>) -> Result<RemoteResponse> {
        let next = self.stage.transition(Step::Check)?;
        let version = if self.stage == ChainStage::Init {
            CheckVersion::Active
        } else {
            CheckVersion::Inactive
        };
        let response = guarded(
            Step::Check,
            self.options.step_timeout,
            self.ops
                .check_syntax(self.conn.as_ref(), &self.object, version, payload),
        )
        .await?;
        self.state.check_result = Some(response.clone());
        self.stage = next;
        Ok(response)
    }

    /// Acquire the remote lock and record it.
    ///
    /// The connection turns stateful before the request. On success the
    /// handle is written to the registry, kept in memory, and passed to the
    /// `on_lock` hook, in that order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` out of order, the remote error, or
    /// the registry error (including `Conflict`). When the record cannot be
    /// written the new lock is released again; if that release fails too the
    /// handle stays in memory for [`Self::force_unlock`].
    pub async fn lock(&mut self) -> Result<String> {
        let next = self.stage.transition(Step::Lock)?;
        self.conn.set_session_mode(SessionMode::Stateful);

        let acquired = guarded(
            Step::Lock,
            self.options.step_timeout,
            self.ops.acquire_lock(self.conn.as_ref(), &self.object),
        )
        .await;
        let handle = match acquired {
            Ok(handle) => handle,
            Err(err) => {
                self.conn.set_session_mode(SessionMode::Stateless);
                if err.is_network() {
                    warn!(
                        object = %self.object,
                        session_id = self.conn.session_id(),
                        "lock request got no response; the server may hold a lock for this session"
                    );
                }
                return Err(err);
            }
        };

        let record = LockRecord::new(&self.object.key(), self.conn.session_id(), handle.as_str());
        if let Err(err) = self.registry.set_lock(&record).await {
            self.release_unrecorded(&handle).await;
            return Err(err);
        }
        self.state.lock_handle = Some(handle.clone());
        self.stage = next;
        info!(
            object = %self.object,
            session_id = self.conn.session_id(),
            handle = %truncate_handle(&handle),
            "lock acquired"
        );

        if let Some(hook) = &self.on_lock {
            hook(&handle);
        }
        Ok(handle)
    }

    /// Adopt a lock recorded by an earlier invocation of this session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no record exists, `AppError::Conflict`
    /// if it belongs to another session, or `AppError::InvalidState` out of
    /// order.
    pub async fn resume_lock(&mut self) -> Result<String> {
        let next = self.stage.transition(Step::Lock)?;
        let key = self.object.key();
        let record = self
            .registry
            .get(&key)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no lock recorded for {key}")))?;
        if record.session_id != self.conn.session_id() {
            return Err(AppError::Conflict(format!(
                "{key} is recorded as locked by session {}",
                record.session_id
            )));
        }

        self.conn.set_session_mode(SessionMode::Stateful);
        self.state.lock_handle = Some(record.lock_handle.clone());
        self.stage = next;
        info!(object = %self.object, session_id = self.conn.session_id(), "recorded lock resumed");
        Ok(record.lock_handle)
    }

    /// Write `payload` under the held lock.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` if no lock is held or the step is out
    /// of order, or the remote error.
    pub async fn update(&mut self, payload: &str) -> Result<RemoteResponse> {
        let next = self.stage.transition(Step::Update)?;
        let handle = self.held_handle(Step::Update)?;
        let response = guarded(
            Step::Update,
            self.options.step_timeout,
            self.ops
                .update(self.conn.as_ref(), &self.object, &handle, payload),
        )
        .await?;
        self.state.update_result = Some(response.clone());
        self.stage = next;
        Ok(response)
    }

    /// Release the held lock.
    ///
    /// On success the registry record and in-memory handle are cleared and
    /// the connection returns to stateless. On failure nothing changes.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` if no lock is held or the step is out
    /// of order, the remote error, or a registry error after a successful
    /// remote unlock.
    pub async fn unlock(&mut self) -> Result<RemoteResponse> {
        let next = self.stage.transition(Step::Unlock)?;
        let handle = self.held_handle(Step::Unlock)?;
        let response = guarded(
            Step::Unlock,
            self.options.step_timeout,
            self.ops.unlock(self.conn.as_ref(), &self.object, &handle),
        )
        .await?;

        self.state.unlock_result = Some(response.clone());
        self.state.lock_handle = None;
        self.stage = next;
        self.conn.set_session_mode(SessionMode::Stateless);
        self.forget_lock(&handle).await?;
        info!(object = %self.object, session_id = self.conn.session_id(), "lock released");
        Ok(response)
    }

    /// Activate the object.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` out of order, or the remote error.
    pub async fn activate(&mut self) -> Result<RemoteResponse> {
        let next = self.stage.transition(Step::Activate)?;
        let response = guarded(
            Step::Activate,
            self.options.step_timeout,
            self.ops.activate(self.conn.as_ref(), &self.object),
        )
        .await?;
        self.state.activate_result = Some(response.clone());
        self.stage = next;
        Ok(response)
    }

    /// Delete the object, passing the held lock handle if any.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` out of order, or the remote error.
    pub async fn delete(&mut self) -> Result<RemoteResponse> {
        let next = self.stage.transition(Step::Delete)?;
        let handle = self.state.lock_handle.clone();
        let response = guarded(
            Step::Delete,
            self.options.step_timeout,
            self.ops
                .delete(self.conn.as_ref(), &self.object, handle.as_deref()),
        )
        .await?;
        self.state.delete_result = Some(response.clone());
        self.stage = next;
        Ok(response)
    }

    /// Read the object, optionally long-polling until it is visible.
    ///
    /// # Errors
    ///
    /// Returns the remote error, or `AppError::Network` when the wait budget
    /// runs out.
    pub async fn read(&mut self, wait_for_consistency: Option<Duration>) -> Result<RemoteResponse> {
        let response = guarded(
            Step::Read,
            self.options.step_timeout,
            self.ops
                .read(self.conn.as_ref(), &self.object, wait_for_consistency),
        )
        .await?;
        self.state.read_result = Some(response.clone());
        Ok(response)
    }

    /// Release whatever lock this orchestrator or the registry knows about
    /// for the object, and clear local state whatever the server answers.
    ///
    /// Safe to call repeatedly. A record is only removed while it still
    /// names the handle that was released, so a record written by another
    /// session after a `Conflict` survives.
    ///
    /// # Errors
    ///
    /// Returns registry errors only; remote failures are reported through
    /// [`ForceUnlockOutcome::UnlockFailed`].
    pub async fn force_unlock(&mut self) -> Result<ForceUnlockOutcome> {
        let key = self.object.key();
        let record = match self.state.lock_handle.clone() {
            Some(handle) => Some(LockRecord::new(&key, self.conn.session_id(), handle.as_str())),
            None => self.registry.get(&key).await?.inspect(|record| {
                if record.session_id != self.conn.session_id() {
                    warn!(
                        object = %self.object,
                        owner = %record.session_id,
                        "force-unlocking a lock recorded by another session"
                    );
                }
            }),
        };

        let Some(record) = record else {
            self.conn.set_session_mode(SessionMode::Stateless);
            return Ok(ForceUnlockOutcome::NothingHeld);
        };

        let handle = record.lock_handle.clone();
        self.conn.set_session_mode(SessionMode::Stateful);
        let result = guarded(
            Step::Unlock,
            self.options.step_timeout,
            self.ops.unlock(self.conn.as_ref(), &self.object, &handle),
        )
        .await;

        self.state.lock_handle = None;
        if matches!(
            self.stage,
            ChainStage::Locked | ChainStage::CheckedWithPayload | ChainStage::Updated
        ) {
            self.stage = ChainStage::Unlocked;
        }
        self.conn.set_session_mode(SessionMode::Stateless);
        self.registry.remove_if_unchanged(&record).await?;

        match result {
            Ok(response) => {
                self.state.unlock_result = Some(response);
                info!(object = %self.object, "force unlock succeeded");
                Ok(ForceUnlockOutcome::Unlocked)
            }
            Err(err) => {
                warn!(
                    object = %self.object,
                    handle = %truncate_handle(&handle),
                    %err,
                    "force unlock failed remotely; local bookkeeping cleared"
                );
                Ok(ForceUnlockOutcome::UnlockFailed(err.to_string()))
            }
        }
    }

    // ─── Chains ──────────────────────────────────────────────

    /// Validate, create, check, lock, check the source, write it, unlock,
    /// run the final check, and optionally activate.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Chain` naming the failed step; the cause is the
    /// step's original error. A validation `Alternate` outcome fails the
    /// chain with `AppError::RemoteRejected`.
    pub async fn run_create(&mut self, create_payload: Option<&str>, source: &str) -> Result<()> {
        let span = self.chain_span("create");
        self.create_chain(create_payload, source)
            .instrument(span)
            .await
    }

    /// Lock, check the source, write it, unlock, run the final check, and
    /// optionally activate.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Chain` naming the failed step.
    pub async fn run_update(&mut self, source: &str) -> Result<()> {
        let span = self.chain_span("update");
        self.update_chain(source).instrument(span).await
    }

    /// Check, then delete.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Chain` naming the failed step.
    pub async fn run_delete(&mut self) -> Result<()> {
        let span = self.chain_span("delete");
        self.delete_chain().instrument(span).await
    }

    /// Write `source` under a lock recorded by an earlier invocation, leaving
    /// the lock held.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Chain` naming the failed step. A failure after the
    /// lock was resumed triggers the usual unlock compensation.
    pub async fn run_write(&mut self, source: &str) -> Result<()> {
        let span = self.chain_span("write");
        async {
            attempt!(self, Step::Lock, self.resume_lock().await);
            attempt!(self, Step::Check, self.check(Some(source)).await);
            attempt!(self, Step::Update, self.update(source).await);
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn create_chain(&mut self, create_payload: Option<&str>, source: &str) -> Result<()> {
        info!("create chain started");
        match attempt!(self, Step::Validate, self.validate().await) {
            Outcome::Ok(_) => {}
            Outcome::Alternate { reason, response } => {
                let err = AppError::RemoteRejected {
                    status: response.status,
                    body: reason,
                };
                return Err(self.abort(Step::Validate, err).await);
            }
        }
        attempt!(self, Step::Create, self.create(create_payload).await);
        attempt!(self, Step::Check, self.check(None).await);
        self.edit_under_lock(source).await?;
        self.finish();
        info!("create chain finished");
        Ok(())
    }

    async fn update_chain(&mut self, source: &str) -> Result<()> {
        info!("update chain started");
        self.edit_under_lock(source).await?;
        self.finish();
        info!("update chain finished");
        Ok(())
    }

    async fn delete_chain(&mut self) -> Result<()> {
        info!("delete chain started");
        attempt!(self, Step::Check, self.check(None).await);
        attempt!(self, Step::Delete, self.delete().await);
        self.finish();
        info!("delete chain finished");
        Ok(())
    }

    /// Shared tail of the create and update chains.
    async fn edit_under_lock(&mut self, source: &str) -> Result<()> {
        attempt!(self, Step::Lock, self.lock().await);
        attempt!(self, Step::Check, self.check(Some(source)).await);
        attempt!(self, Step::Update, self.update(source).await);
        attempt!(self, Step::Unlock, self.unlock().await);

        attempt!(self, Step::Read, self.settle().await);
        match self.check(None).await {
            Ok(_) => {}
            Err(err) if err.is_network() => {
                self.tolerate(Step::Check, &err);
                self.stage = ChainStage::CheckedFinal;
            }
            Err(err) => return Err(self.abort(Step::Check, err).await),
        }

        if self.options.activate {
            attempt!(self, Step::Activate, self.activate().await);
            attempt!(self, Step::Read, self.settle().await);
        }
        Ok(())
    }

    /// Consistency read whose timeout is only a warning.
    async fn settle(&mut self) -> Result<()> {
        match self.read(Some(self.options.consistency_timeout)).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_network() => {
                self.tolerate(Step::Read, &err);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn tolerate(&mut self, step: Step, err: &AppError) {
        warn!(object = %self.object, %step, %err, "tolerated failure");
        self.state.warnings.push(format!("{step}: {err}"));
    }

    fn finish(&mut self) {
        if self.stage.can_finish() {
            self.stage = ChainStage::Done;
        }
    }

    /// Undo a remote lock whose registry record could not be written.
    async fn release_unrecorded(&mut self, handle: &str) {
        let released = guarded(
            Step::Unlock,
            self.options.step_timeout,
            self.ops.unlock(self.conn.as_ref(), &self.object, handle),
        )
        .await;
        match released {
            Ok(response) => {
                self.state.unlock_result = Some(response);
                info!(object = %self.object, "unrecorded lock released");
            }
            Err(err) => {
                let failed = AppError::CompensationFailed(format!(
                    "unlock of unrecorded lock on {} with handle {} failed: {err}",
                    self.object,
                    truncate_handle(handle)
                ));
                warn!(object = %self.object, handle, error = %failed, "lock left in place");
                self.state.warnings.push(failed.to_string());
                self.state.lock_handle = Some(handle.to_owned());
            }
        }
        self.conn.set_session_mode(SessionMode::Stateless);
    }

    /// Drop the registry record only if it is still the one this session wrote.
    async fn forget_lock(&self, handle: &str) -> Result<()> {
        let record = LockRecord::new(&self.object.key(), self.conn.session_id(), handle);
        self.registry.remove_if_unchanged(&record).await?;
        Ok(())
    }

    fn held_handle(&self, step: Step) -> Result<String> {
        self.state.lock_handle.clone().ok_or_else(|| {
            AppError::InvalidState(format!("{step} requires a held lock on {}", self.object))
        })
    }

    fn chain_span(&self, chain: &'static str) -> tracing::Span {
        info_span!(
            "chain",
            chain,
            kind = %self.object.kind,
            object = %self.object,
            session_id = %self.conn.session_id()
        )
    }

    /// Compensate after a failed step and wrap the original error.
    async fn abort(&mut self, step: Step, cause: AppError) -> AppError {
        self.state.record_failure(step, &cause);
        error!(object = %self.object, %step, error = %cause, "chain step failed");

        if let Some(handle) = self.state.lock_handle.clone() {
            self.conn.set_session_mode(SessionMode::Stateful);
            let unlocked = guarded(
                Step::Unlock,
                self.options.step_timeout,
                self.ops.unlock(self.conn.as_ref(), &self.object, &handle),
            )
            .await;
            match unlocked {
                Ok(response) => {
                    self.state.unlock_result = Some(response);
                    self.state.lock_handle = None;
                    if let Err(err) = self.forget_lock(&handle).await {
                        warn!(object = %self.object, %err, "lock released but record removal failed");
                    }
                    info!(object = %self.object, "compensating unlock succeeded");
                }
                Err(err) => {
                    let failed = AppError::CompensationFailed(format!(
                        "unlock of {} with handle {} failed: {err}",
                        self.object,
                        truncate_handle(&handle)
                    ));
                    warn!(object = %self.object, error = %failed, "lock left in place");
                    self.state.warnings.push(failed.to_string());
                }
            }
        }

        if self.options.delete_on_failure && self.created {
            self.conn.set_session_mode(SessionMode::Stateful);
            let handle = self.state.lock_handle.clone();
            let deleted = guarded(
                Step::Delete,
                self.options.step_timeout,
                self.ops
                    .delete(self.conn.as_ref(), &self.object, handle.as_deref()),
            )
            .await;
            match deleted {
                Ok(response) => {
                    self.state.delete_result = Some(response);
                    self.created = false;
                    info!(object = %self.object, "partially created object deleted");
                }
                Err(err) => {
                    let failed =
                        AppError::CompensationFailed(format!("delete of {} failed: {err}", self.object));
                    warn!(object = %self.object, error = %failed, "created object left in place");
                    self.state.warnings.push(failed.to_string());
                }
            }
        }

        self.conn.set_session_mode(SessionMode::Stateless);
        self.wrap_failure(step, cause)
    }

    /// Report a failed single step as a chain failure, without compensating.
    ///
    /// A lock held at this point stays held and is named in the failure, so
    /// the caller can follow up with [`Self::force_unlock`].
    pub fn step_failure(&mut self, step: Step, cause: AppError) -> AppError {
        if matches!(cause, AppError::Chain(_)) {
            return cause;
        }
        self.state.record_failure(step, &cause);
        error!(object = %self.object, %step, error = %cause, "step failed");
        self.wrap_failure(step, cause)
    }

    fn wrap_failure(&self, step: Step, cause: AppError) -> AppError {
        ChainFailure {
            step,
            cause,
            held_lock: self.state.lock_handle.clone(),
            session_id: self.conn.session_id().to_owned(),
            object: self.object.to_string(),
        }
        .into()
    }
}

/// Run one collaborator call under the step span and optional time limit.
async fn guarded<T>(step: Step, limit: Option<Duration>, call: BoxFuture<'_, T>) -> Result<T> {
    let span = debug_span!("step", %step);
    match limit {
        Some(limit) => tokio::time::timeout(limit, call)
            .instrument(span)
            .await
            .unwrap_or_else(|_| {
                Err(AppError::Network(format!(
                    "{step} timed out after {}ms",
                    limit.as_millis()
                )))
            }),
        None => call.instrument(span).await,
    }
}
