//! DuckDB-backed persistence for the action queue and attachment cache.
//!
//! A single database file holds two tables: `pending_actions` keyed by id
//! with a secondary index on creation time, and `attachments` keyed by
//! attachment key. Every statement runs in autocommit mode, so a write is
//! durable once the call returns.

mod actions;
mod attachments;

use chrono::Utc;
use duckdb::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version BIGINT PRIMARY KEY,
    applied_at_us BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS pending_actions (
    id VARCHAR PRIMARY KEY,
    action_type VARCHAR NOT NULL,
    payload VARCHAR NOT NULL,
    attachment_key VARCHAR,
    created_at_us BIGINT NOT NULL,
    status VARCHAR NOT NULL,
    retry_count BIGINT NOT NULL DEFAULT 0,
    last_error VARCHAR,
    failure_kind VARCHAR,
    last_attempt_us BIGINT
);

CREATE INDEX IF NOT EXISTS idx_pending_actions_created_at
    ON pending_actions (created_at_us);

CREATE TABLE IF NOT EXISTS attachments (
    key VARCHAR PRIMARY KEY,
    bytes BLOB NOT NULL,
    content_type VARCHAR NOT NULL,
    cached_at_us BIGINT NOT NULL,
    size_bytes BIGINT NOT NULL
);
"#;

/// Connection plus the last timestamp handed out, guarded together so that
/// timestamps are strictly increasing across both tables.
struct Inner {
    conn: Connection,
    last_timestamp_us: i64,
}

impl Inner {
    /// Current time in microseconds, bumped past the last issued value when
    /// the wall clock stalls or moves backwards.
    fn next_timestamp_us(&mut self) -> i64 {
        let now = Utc::now().timestamp_micros();
        let next = now.max(self.last_timestamp_us + 1);
        self.last_timestamp_us = next;
        next
    }
}

/// Handle to the local database. Cloning shares the same connection.
#[derive(Clone)]
pub struct Persistence {
    inner: Arc<Mutex<Inner>>,
}

impl Persistence {
    /// Open (or create) the database at `path`, apply the schema and reset
    /// actions left `syncing` by an interrupted run.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                SyncError::Internal(format!(
                    "failed to create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
        debug!("Opening queue database at {}", path.display());
        Self::from_connection(Connection::open(path)?)
    }

    /// Non-durable database, for tests and dry runs.
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        migrate(&conn)?;
        let last_timestamp_us = latest_timestamp_us(&conn)?;

        let reset = reset_interrupted(&conn)?;
        if reset > 0 {
            warn!(
                "Reset {} action(s) interrupted mid-sync back to pending",
                reset
            );
        }

        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                conn,
                last_timestamp_us,
            })),
        })
    }

    /// Run `f` against the connection on the blocking thread pool.
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Inner) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut guard = inner
                .lock()
                .map_err(|_| SyncError::Internal("persistence lock poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| SyncError::Internal(format!("persistence task failed: {}", e)))?
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;

    let applied: i64 = conn.query_row(
        "SELECT COUNT(*) FROM schema_version WHERE version = ?",
        params![SCHEMA_VERSION],
        |row| row.get(0),
    )?;
    if applied == 0 {
        conn.execute(
            "INSERT INTO schema_version (version, applied_at_us) VALUES (?, ?)",
            params![SCHEMA_VERSION, Utc::now().timestamp_micros()],
        )?;
        info!("Applied queue schema version {}", SCHEMA_VERSION);
    }
    Ok(())
}

/// Return actions left `syncing` by an interrupted pass to `pending`.
fn reset_interrupted(conn: &Connection) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE pending_actions SET status = 'pending' WHERE status = 'syncing'",
        params![],
    )?)
}

fn latest_timestamp_us(conn: &Connection) -> Result<i64> {
    let latest: i64 = conn.query_row(
        "SELECT GREATEST(
            COALESCE((SELECT MAX(created_at_us) FROM pending_actions), 0),
            COALESCE((SELECT MAX(cached_at_us) FROM attachments), 0)
        )",
        params![],
        |row| row.get(0),
    )?;
    Ok(latest)
}

fn micros_to_datetime(us: i64) -> Result<chrono::DateTime<Utc>> {
    chrono::DateTime::from_timestamp_micros(us)
        .ok_or_else(|| SyncError::Internal(format!("timestamp out of range: {}", us)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn opens_fresh_database_and_records_schema_version() {
        let dir = tempdir().expect("tempdir");
        let db_path = dir.path().join("nested").join("queue.duckdb");
        let persistence = Persistence::new(&db_path).expect("persistence");
        assert!(db_path.exists());

        let guard = persistence.inner.lock().expect("lock");
        let version: i64 = guard
            .conn
            .query_row("SELECT MAX(version) FROM schema_version", params![], |row| {
                row.get(0)
            })
            .expect("version");
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn reopening_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let db_path = dir.path().join("queue.duckdb");
        drop(Persistence::new(&db_path).expect("first open"));
        let persistence = Persistence::new(&db_path).expect("second open");

        let guard = persistence.inner.lock().expect("lock");
        let rows: i64 = guard
            .conn
            .query_row("SELECT COUNT(*) FROM schema_version", params![], |row| {
                row.get(0)
            })
            .expect("count");
        assert_eq!(rows, 1);
    }

    #[test]
    fn timestamps_strictly_increase() {
        let persistence = Persistence::in_memory().expect("persistence");
        let mut guard = persistence.inner.lock().expect("lock");
        guard.last_timestamp_us = i64::MAX / 2;
        let a = guard.next_timestamp_us();
        let b = guard.next_timestamp_us();
        assert_eq!(a, i64::MAX / 2 + 1);
        assert_eq!(b, a + 1);
    }
}
