//! Directory-backed session store.
//!
//! Each session is one JSON file named `<session_id>.json`. Writes go to a
//! temporary file in the same directory and are renamed into place, so a
//! concurrent reader sees either the previous record or the new one.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::models::session::{Session, SessionMetadata};
use crate::{AppError, Result};

const RECORD_EXTENSION: &str = "json";
const MAX_ID_LEN: usize = 128;

/// Subset of a session record read by [`SessionStore::metadata`].
#[derive(Debug, Deserialize)]
struct MetadataRow {
    created_at: DateTime<Utc>,
    owner_pid: u32,
}

/// Durable keyed storage of per-session connection state.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    /// Create a store rooted at `dir`. The directory is created lazily on
    /// the first write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the session records.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create and persist a new empty session owned by this process.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AlreadyExists` if a record with that id exists and
    /// `overwrite` is `false`, `AppError::Config` for an invalid id, or
    /// `AppError::Io` on write failure.
    pub fn create(&self, session_id: &str, overwrite: bool) -> Result<Session> {
        let session = Session::new(session_id);
        if overwrite {
            self.save(&session)?;
        } else {
            self.write_record(&session, false)?;
        }
        debug!(session_id, overwrite, "session created");
        Ok(session)
    }

    /// Load the session, creating it when absent.
    ///
    /// # Errors
    ///
    /// Propagates load and create failures.
    pub fn open_or_create(&self, session_id: &str) -> Result<Session> {
        if let Some(session) = self.load(session_id)? {
            return Ok(session);
        }
        match self.create(session_id, false) {
            // Another invocation created it between our load and create.
            Err(AppError::AlreadyExists(_)) => self
                .load(session_id)?
                .ok_or_else(|| AppError::NotFound(format!("session {session_id}"))),
            other => other,
        }
    }

    /// Persist the full session record, replacing any previous version.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for an invalid id or `AppError::Io` /
    /// `AppError::Serde` on write failure.
    pub fn save(&self, session: &Session) -> Result<()> {
        self.write_record(session, true)
    }

    /// Read a session record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the file exists but cannot be read, or
    /// `AppError::Serde` if it is corrupt. A missing record is `Ok(None)`.
    pub fn load(&self, session_id: &str) -> Result<Option<Session>> {
        let Some(raw) = self.read_record(session_id)? else {
            return Ok(None);
        };
        let session: Session = serde_json::from_str(&raw)
            .map_err(|err| AppError::Serde(format!("session {session_id}: {err}")))?;
        Ok(Some(session))
    }

    /// Snapshot of the stored session ids, sorted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the directory cannot be read. A missing
    /// directory yields an empty list.
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            if let Some(id) = path.file_stem().and_then(|stem| stem.to_str()) {
                if validate_id(id).is_ok() {
                    ids.push(id.to_owned());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Remove a session record. Returns `true` if a record was removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` on failures other than "not found".
    pub fn delete(&self, session_id: &str) -> Result<bool> {
        let path = self.record_path(session_id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Remove every session record. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if listing or deleting fails.
    pub fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for id in self.list()? {
            if self.delete(&id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Creation time, owner and age of a session without decoding cookies.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` / `AppError::Serde` for unreadable records.
    pub fn metadata(&self, session_id: &str) -> Result<Option<SessionMetadata>> {
        let Some(raw) = self.read_record(session_id)? else {
            return Ok(None);
        };
        let row: MetadataRow = serde_json::from_str(&raw)
            .map_err(|err| AppError::Serde(format!("session {session_id}: {err}")))?;
        Ok(Some(SessionMetadata {
            created_at: row.created_at,
            owner_pid: row.owner_pid,
            age_millis: (Utc::now() - row.created_at).num_milliseconds(),
        }))
    }

    fn record_path(&self, session_id: &str) -> Result<PathBuf> {
        validate_id(session_id)?;
        Ok(self.dir.join(format!("{session_id}.{RECORD_EXTENSION}")))
    }

    fn read_record(&self, session_id: &str) -> Result<Option<String>> {
        let path = self.record_path(session_id)?;
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(AppError::Io(format!(
                "failed to read {}: {err}",
                path.display()
            ))),
        }
    }

    fn write_record(&self, session: &Session, overwrite: bool) -> Result<()> {
        let path = self.record_path(&session.session_id)?;
        fs::create_dir_all(&self.dir).map_err(|err| {
            AppError::Io(format!(
                "failed to create session dir {}: {err}",
                self.dir.display()
            ))
        })?;

        let json = serde_json::to_vec_pretty(session)?;
        let mut tmp = NamedTempFile::new_in(&self.dir)
            .map_err(|err| AppError::Io(format!("failed to create temporary file: {err}")))?;
        tmp.write_all(&json)
            .map_err(|err| AppError::Io(format!("failed to write temporary file: {err}")))?;
        tmp.as_file()
            .sync_all()
            .map_err(|err| AppError::Io(format!("failed to flush temporary file: {err}")))?;

        if overwrite {
            tmp.persist(&path).map_err(|err| {
                AppError::Io(format!("failed to persist {}: {err}", path.display()))
            })?;
        } else {
            tmp.persist_noclobber(&path).map_err(|err| {
                if err.error.kind() == ErrorKind::AlreadyExists {
                    AppError::AlreadyExists(format!("session {}", session.session_id))
                } else {
                    AppError::Io(format!("failed to persist {}: {err}", path.display()))
                }
            })?;
        }
        Ok(())
    }
}

/// Reject ids that would not map to exactly one file in the store directory.
fn validate_id(session_id: &str) -> Result<()> {
    let valid = !session_id.is_empty()
        && session_id.len() <= MAX_ID_LEN
        && !session_id.starts_with('.')
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(AppError::Config(format!("invalid session id: {session_id:?}")))
    }
}
