//! `SQLite` schema bootstrap logic.
//!
//! Uses `CREATE TABLE IF NOT EXISTS`, so it is safe to run on every
//! invocation.

use sqlx::SqlitePool;

use crate::Result;

/// Apply the lock registry table definitions.
///
/// `sub_key` is stored as `''` when absent so it can take part in the
/// primary key.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS lock_record (
    object_kind     TEXT NOT NULL,
    object_name     TEXT NOT NULL,
    sub_key         TEXT NOT NULL DEFAULT '',
    session_id      TEXT NOT NULL,
    lock_handle     TEXT NOT NULL,
    acquired_at     TEXT NOT NULL,
    owner_pid       INTEGER NOT NULL,
    PRIMARY KEY (object_kind, object_name, sub_key)
);

CREATE INDEX IF NOT EXISTS idx_lock_session ON lock_record(session_id);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
