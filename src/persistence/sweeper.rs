//! Staleness and liveness sweeps over the session store and lock registry.
//!
//! Sweeps only forget local bookkeeping. They never call the remote server,
//! so a swept lock record may still correspond to a lock the server holds.

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::models::lock::{truncate_handle, LockRecord};
use crate::process::{self, Liveness};
use crate::Result;

use super::lock_registry::LockRegistry;
use super::session_store::SessionStore;

/// Default age, in seconds, after which bookkeeping is considered stale.
pub const DEFAULT_STALE_AFTER_SECONDS: u64 = 1800;

/// Function used to probe process liveness.
pub type LivenessProbe = fn(u32) -> Liveness;

/// Summary of a combined sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions removed for age.
    pub stale_sessions: Vec<String>,
    /// Sessions removed because their owning process is gone.
    pub dead_sessions: Vec<String>,
    /// Lock records removed for age.
    pub stale_locks: Vec<LockRecord>,
    /// Lock records removed because their session no longer exists.
    pub orphaned_locks: Vec<LockRecord>,
}

impl SweepReport {
    /// Total number of removed entries.
    #[must_use]
    pub fn total(&self) -> usize {
        self.stale_sessions.len()
            + self.dead_sessions.len()
            + self.stale_locks.len()
            + self.orphaned_locks.len()
    }
}

/// Removes session and lock bookkeeping that is too old or whose owner died.
#[derive(Clone)]
pub struct Sweeper {
    sessions: SessionStore,
    locks: LockRegistry,
    stale_after: Duration,
    probe: LivenessProbe,
}

impl Sweeper {
    /// Build a sweeper using the OS process probe.
    #[must_use]
    pub fn new(sessions: SessionStore, locks: LockRegistry, stale_after: Duration) -> Self {
        Self {
            sessions,
            locks,
            stale_after,
            probe: process::probe,
        }
    }

    /// Replace the liveness probe.
    #[must_use]
    pub fn with_probe(mut self, probe: LivenessProbe) -> Self {
        self.probe = probe;
        self
    }

    /// Configured staleness threshold.
    #[must_use]
    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Remove sessions created longer ago than the threshold.
    ///
    /// Unreadable records are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` only if the session directory cannot be listed.
    pub fn sweep_stale_sessions(&self) -> Result<Vec<String>> {
        let now = Utc::now();
        self.sweep_sessions("stale", |created_at, _| self.is_stale(created_at, now))
    }

    /// Remove sessions whose owning process no longer exists.
    ///
    /// Probes that are inconclusive (e.g. permission denied) keep the record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` only if the session directory cannot be listed.
    pub fn sweep_dead_process_sessions(&self) -> Result<Vec<String>> {
        let probe = self.probe;
        self.sweep_sessions("dead_process", |_, owner_pid| {
            probe(owner_pid) == Liveness::Dead
        })
    }

    /// Remove lock records acquired longer ago than the threshold.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` only if the registry cannot be scanned.
    pub async fn sweep_stale_locks(&self) -> Result<Vec<LockRecord>> {
        let now = Utc::now();
        self.sweep_locks("stale", |record| Ok(self.is_stale(record.acquired_at, now)))
            .await
    }

    /// Remove lock records whose owning session is no longer in the store.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` only if the registry cannot be scanned.
    pub async fn sweep_orphaned_locks(&self) -> Result<Vec<LockRecord>> {
        self.sweep_locks("orphaned", |record| {
            Ok(self.sessions.load(&record.session_id)?.is_none())
        })
        .await
    }

    /// Run every sweep: dead and stale sessions first, then stale and
    /// orphaned locks.
    ///
    /// # Errors
    ///
    /// Propagates listing failures from the individual sweeps.
    pub async fn sweep_all(&self) -> Result<SweepReport> {
        let dead_sessions = self.sweep_dead_process_sessions()?;
        let stale_sessions = self.sweep_stale_sessions()?;
        let stale_locks = self.sweep_stale_locks().await?;
        let orphaned_locks = self.sweep_orphaned_locks().await?;
        Ok(SweepReport {
            stale_sessions,
            dead_sessions,
            stale_locks,
            orphaned_locks,
        })
    }

    fn is_stale(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - since > self.stale_after
    }

    fn sweep_sessions(
        &self,
        reason: &'static str,
        should_remove: impl Fn(DateTime<Utc>, u32) -> bool,
    ) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for session_id in self.sessions.list()? {
            let meta = match self.sessions.metadata(&session_id) {
                Ok(Some(meta)) => meta,
                // Deleted by a concurrent sweep or cleanup.
                Ok(None) => continue,
                Err(err) => {
                    warn!(%session_id, %err, "skipping unreadable session record");
                    continue;
                }
            };
            if !should_remove(meta.created_at, meta.owner_pid) {
                continue;
            }
            match self.sessions.delete(&session_id) {
                Ok(true) => {
                    info!(
                        %session_id,
                        owner_pid = meta.owner_pid,
                        age_millis = meta.age_millis,
                        reason,
                        "session swept"
                    );
                    removed.push(session_id);
                }
                Ok(false) => {}
                Err(err) => warn!(%session_id, %err, "failed to remove swept session"),
            }
        }
        Ok(removed)
    }

    async fn sweep_locks(
        &self,
        reason: &'static str,
        should_remove: impl Fn(&LockRecord) -> Result<bool>,
    ) -> Result<Vec<LockRecord>> {
        let mut removed = Vec::new();
        for scanned in self.locks.scan().await? {
            let record = match scanned {
                Ok(record) => record,
                Err(err) => {
                    warn!(%err, "skipping unreadable lock record");
                    continue;
                }
            };
            match should_remove(&record) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    warn!(key = %record.key(), %err, "skipping lock record that could not be evaluated");
                    continue;
                }
            }
            match self.locks.remove_if_unchanged(&record).await {
                Ok(true) => {
                    warn!(
                        key = %record.key(),
                        session_id = %record.session_id,
                        lock_handle = %truncate_handle(&record.lock_handle),
                        reason,
                        "lock bookkeeping swept without remote unlock; the server may still hold the lock"
                    );
                    removed.push(record);
                }
                Ok(false) => {}
                Err(err) => warn!(key = %record.key(), %err, "failed to remove swept lock record"),
            }
        }
        Ok(removed)
    }
}
