//! SQLite storage shared by the work queue and the escalation protocol.
//!
//! One file (`.ratchet/queue.db`) holds tasks, checkpoint streams, decision
//! requests and decisions. Any number of driver processes may open it; every
//! mutation that must not race runs inside a `BEGIN IMMEDIATE` transaction and
//! the connection waits on `busy_timeout` instead of failing under contention.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::errors::StoreError;

/// How long a connection waits for another writer before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Async-safe handle to the queue database.
///
/// Wraps `Database` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone, Debug)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<Database>>,
}

impl DbHandle {
    pub fn new(db: Database) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with exclusive access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R, E>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut Database) -> Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: From<StoreError> + Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = db.lock().map_err(|_| E::from(StoreError::LockPoisoned))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| E::from(StoreError::Join(e)))?
    }

    /// Acquire the database mutex synchronously. For startup and tests only.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, Database>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

#[derive(Debug)]
pub struct Database {
    pub(crate) conn: Connection,
}

impl Database {
    /// Open (or create) the queue database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<(), StoreError> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.run_migrations()
    }

    fn run_migrations(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tasks (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                priority INTEGER NOT NULL DEFAULT 0,
                dependencies TEXT NOT NULL DEFAULT '[]',
                retry_count INTEGER NOT NULL DEFAULT 0,
                iteration_budget INTEGER NOT NULL CHECK (iteration_budget > 0),
                completion_sentinel TEXT NOT NULL,
                session_ref TEXT NOT NULL,
                owner TEXT,
                lease_expires_at INTEGER,
                status_reason TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                CHECK (retry_count <= iteration_budget)
            );

            CREATE TABLE IF NOT EXISTS checkpoints (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                iteration INTEGER NOT NULL,
                transition TEXT NOT NULL,
                verdict TEXT,
                reason TEXT,
                recoverable INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS archived_tasks (
                seq INTEGER PRIMARY KEY,
                id TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL,
                status TEXT NOT NULL,
                priority INTEGER NOT NULL,
                dependencies TEXT NOT NULL,
                retry_count INTEGER NOT NULL,
                iteration_budget INTEGER NOT NULL,
                completion_sentinel TEXT NOT NULL,
                session_ref TEXT NOT NULL,
                owner TEXT,
                lease_expires_at INTEGER,
                status_reason TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                archived_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS archived_checkpoints (
                id INTEGER PRIMARY KEY,
                task_id TEXT NOT NULL,
                iteration INTEGER NOT NULL,
                transition TEXT NOT NULL,
                verdict TEXT,
                reason TEXT,
                recoverable INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                archived_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS decision_requests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                reason TEXT NOT NULL,
                evidence TEXT NOT NULL DEFAULT '[]',
                iteration INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                resolved_at TEXT,
                resolution TEXT
            );

            CREATE TABLE IF NOT EXISTS decisions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id INTEGER NOT NULL UNIQUE REFERENCES decision_requests(id),
                task_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                actor TEXT NOT NULL,
                note TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_ready ON tasks(status, priority DESC, seq);
            CREATE INDEX IF NOT EXISTS idx_checkpoints_task ON checkpoints(task_id, id);
            CREATE INDEX IF NOT EXISTS idx_archived_checkpoints_task ON archived_checkpoints(task_id, id);
            CREATE INDEX IF NOT EXISTS idx_decisions_task ON decisions(task_id, id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_decision_requests_open
                ON decision_requests(task_id) WHERE resolved_at IS NULL;

            CREATE TRIGGER IF NOT EXISTS checkpoints_no_update
            BEFORE UPDATE ON checkpoints
            BEGIN
                SELECT RAISE(ABORT, 'checkpoints are append-only');
            END;

            CREATE TRIGGER IF NOT EXISTS decisions_no_update
            BEFORE UPDATE ON decisions
            BEGIN
                SELECT RAISE(ABORT, 'decisions are append-only');
            END;

            CREATE TRIGGER IF NOT EXISTS decisions_no_delete
            BEFORE DELETE ON decisions
            BEGIN
                SELECT RAISE(ABORT, 'decisions are append-only');
            END;
            ",
        )?;
        Ok(())
    }
}

/// Current wall-clock time in epoch milliseconds, the unit of `lease_expires_at`.
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("lease timestamp out of range: {}", ms)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    type Result<T> = std::result::Result<T, StoreError>;

    #[test]
    fn test_migrations_create_tables() -> Result<()> {
        let db = Database::new_in_memory()?;
        let count: i64 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
             ('tasks', 'checkpoints', 'archived_tasks', 'archived_checkpoints', 'decision_requests', 'decisions')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(count, 6);
        Ok(())
    }

    #[test]
    fn test_migrations_are_idempotent() -> Result<()> {
        let dir = tempdir().map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let path = dir.path().join("queue.db");
        drop(Database::open(&path)?);
        let db = Database::open(&path)?;
        db.run_migrations()?;
        Ok(())
    }

    #[test]
    fn test_checkpoints_reject_updates() -> Result<()> {
        let db = Database::new_in_memory()?;
        db.conn.execute(
            "INSERT INTO checkpoints (task_id, iteration, transition, recoverable, created_at)
             VALUES ('t1', 1, 'retry', 1, '2026-01-01T00:00:00Z')",
            [],
        )?;
        let err = db
            .conn
            .execute("UPDATE checkpoints SET iteration = 2", [])
            .unwrap_err();
        assert!(err.to_string().contains("append-only"));
        Ok(())
    }

    #[test]
    fn test_only_one_open_request_per_task() -> Result<()> {
        let db = Database::new_in_memory()?;
        let insert = "INSERT INTO decision_requests (task_id, reason, iteration, created_at)
                      VALUES ('t1', 'budget_exhausted', 3, '2026-01-01T00:00:00Z')";
        db.conn.execute(insert, [])?;
        assert!(db.conn.execute(insert, []).is_err());
        Ok(())
    }

    #[test]
    fn test_millis_roundtrip() -> Result<()> {
        let ms = 1_767_225_600_123;
        assert_eq!(millis_to_datetime(ms)?.timestamp_millis(), ms);
        Ok(())
    }

    #[tokio::test]
    async fn test_handle_call_runs_on_blocking_pool() -> Result<()> {
        let handle = DbHandle::new(Database::new_in_memory()?);
        let n: i64 = handle
            .call(|db| Ok::<_, StoreError>(db.conn.query_row("SELECT 41 + 1", [], |r| r.get(0))?))
            .await?;
        assert_eq!(n, 42);
        Ok(())
    }
}
