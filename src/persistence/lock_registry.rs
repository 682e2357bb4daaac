//! Lock registry backed by `SQLite`.
//!
//! One row per `(object_kind, object_name, sub_key)`. Ownership is
//! decided inside a single upsert statement, so two invocations racing for
//! the same key cannot both win.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::models::lock::{LockKey, LockRecord, ObjectKind};
use crate::{AppError, Result};

use super::db::Database;

/// Repository for lock bookkeeping records.
#[derive(Clone)]
pub struct LockRegistry {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct LockRow {
    object_kind: String,
    object_name: String,
    sub_key: String,
    session_id: String,
    lock_handle: String,
    acquired_at: String,
    owner_pid: i64,
}

impl LockRow {
    fn into_record(self) -> Result<LockRecord> {
        let object_kind: ObjectKind = self
            .object_kind
            .parse()
            .map_err(|_| AppError::Db(format!("invalid object kind: {}", self.object_kind)))?;
        let acquired_at = chrono::DateTime::parse_from_rfc3339(&self.acquired_at)
            .map_err(|e| AppError::Db(format!("invalid acquired_at: {e}")))?
            .with_timezone(&Utc);
        let owner_pid = u32::try_from(self.owner_pid)
            .map_err(|_| AppError::Db(format!("invalid owner_pid: {}", self.owner_pid)))?;

        Ok(LockRecord {
            object_kind,
            object_name: self.object_name,
            sub_key: Some(self.sub_key).filter(|s| !s.is_empty()),
            session_id: self.session_id,
            lock_handle: self.lock_handle,
            acquired_at,
            owner_pid,
        })
    }
}

const SELECT_COLUMNS: &str =
    "SELECT object_kind, object_name, sub_key, session_id, lock_handle, acquired_at, owner_pid
     FROM lock_record";

impl LockRegistry {
    /// Create a new registry instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Fetch the record for an object, if one exists.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails or the row is corrupt.
    pub async fn get_lock(
        &self,
        kind: ObjectKind,
        name: &str,
        sub_key: Option<&str>,
    ) -> Result<Option<LockRecord>> {
        self.get(&LockKey::new(kind, name, sub_key)).await
    }

    /// Fetch the record stored under a normalized key.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails or the row is corrupt.
    pub async fn get(&self, key: &LockKey) -> Result<Option<LockRecord>> {
        let row: Option<LockRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE object_kind = ?1 AND object_name = ?2 AND sub_key = ?3"
        ))
        .bind(key.kind.as_str())
        .bind(&key.name)
        .bind(key.sub_key_column())
        .fetch_optional(self.db.as_ref())
        .await?;

        row.map(LockRow::into_record).transpose()
    }

    /// Insert or refresh a lock record.
    ///
    /// Succeeds when no record exists for the key or when the existing record
    /// belongs to the same session (handle and timestamp are refreshed).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Conflict` if the key is held by a different
    /// session, or `AppError::Db` if the statement fails.
    pub async fn set_lock(&self, record: &LockRecord) -> Result<()> {
        let key = record.key();
        let result = sqlx::query(
            "INSERT INTO lock_record
                 (object_kind, object_name, sub_key, session_id, lock_handle, acquired_at, owner_pid)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (object_kind, object_name, sub_key) DO UPDATE SET
                 lock_handle = excluded.lock_handle,
                 acquired_at = excluded.acquired_at,
                 owner_pid = excluded.owner_pid
             WHERE lock_record.session_id = excluded.session_id",
        )
        .bind(key.kind.as_str())
        .bind(&key.name)
        .bind(key.sub_key_column())
        .bind(&record.session_id)
        .bind(&record.lock_handle)
        .bind(record.acquired_at.to_rfc3339())
        .bind(i64::from(record.owner_pid))
        .execute(self.db.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            let owner = self
                .get(&key)
                .await?
                .map_or_else(|| "unknown".to_owned(), |existing| existing.session_id);
            return Err(AppError::Conflict(format!(
                "{key} is locked by session {owner}, not {}",
                record.session_id
            )));
        }

        debug!(%key, session_id = %record.session_id, "lock record stored");
        Ok(())
    }

    /// Forget the record for an object. Removing an absent record succeeds.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn remove_lock(
        &self,
        kind: ObjectKind,
        name: &str,
        sub_key: Option<&str>,
    ) -> Result<()> {
        self.remove(&LockKey::new(kind, name, sub_key)).await
    }

    /// Forget the record stored under a normalized key.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn remove(&self, key: &LockKey) -> Result<()> {
        sqlx::query(
            "DELETE FROM lock_record WHERE object_kind = ?1 AND object_name = ?2 AND sub_key = ?3",
        )
        .bind(key.kind.as_str())
        .bind(&key.name)
        .bind(key.sub_key_column())
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Delete `record` only if the stored row still carries the same
    /// session and handle. Returns `true` when a row was removed.
    ///
    /// Used by sweeps so a lock re-acquired since the scan is left alone.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn remove_if_unchanged(&self, record: &LockRecord) -> Result<bool> {
        let key = record.key();
        let result = sqlx::query(
            "DELETE FROM lock_record
             WHERE object_kind = ?1 AND object_name = ?2 AND sub_key = ?3
               AND session_id = ?4 AND lock_handle = ?5",
        )
        .bind(key.kind.as_str())
        .bind(&key.name)
        .bind(key.sub_key_column())
        .bind(&record.session_id)
        .bind(&record.lock_handle)
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Snapshot of all lock records, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails or any row is corrupt.
    pub async fn list_locks(&self) -> Result<Vec<LockRecord>> {
        self.scan().await?.into_iter().collect()
    }

    /// Snapshot of all rows, decoding each one independently so a corrupt
    /// row does not hide the others.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query itself fails.
    pub async fn scan(&self) -> Result<Vec<Result<LockRecord>>> {
        let rows: Vec<LockRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} ORDER BY object_kind, object_name, sub_key"
        ))
        .fetch_all(self.db.as_ref())
        .await?;
        Ok(rows.into_iter().map(LockRow::into_record).collect())
    }

    /// All records owned by one session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails or a row is corrupt.
    pub async fn locks_for_session(&self, session_id: &str) -> Result<Vec<LockRecord>> {
        let rows: Vec<LockRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE session_id = ?1 ORDER BY object_kind, object_name, sub_key"
        ))
        .bind(session_id)
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(LockRow::into_record).collect()
    }

    /// Forget every record. Returns the number of rows removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM lock_record")
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected())
    }
}
