//! Typed error hierarchy for the Ratchet engine.
//!
//! One enum per subsystem seam:
//! - `StoreError` for raw SQLite / blocking-pool failures
//! - `QueueError` for work queue operations
//! - `SessionError` for the session state store
//! - `WorkerError` and `VerifyError` for the external collaborators
//! - `EscalationError` for the decision protocol
//! - `ControllerError` for a task-run as a whole
//!
//! `Transient` marks the storage failures worth retrying: I/O, a busy or
//! locked database, a panicked blocking task.
//!
//! `OutcomeClass` names the five ways an iteration can end badly and is
//! attached to controller outcomes and log lines.

use ratchet_common::{TaskStatus, ValidationError, Verdict, VerdictKind};
use std::path::PathBuf;
use thiserror::Error;

/// Errors from the SQLite layer shared by the queue and the escalation protocol.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to open queue database at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Malformed JSON column: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Database task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Errors from work queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Task {id} not found")]
    NotFound { id: String },

    #[error("Task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task {id} is not owned by {owner}")]
    NotOwner { id: String, owner: String },

    #[error("Task {id} would exceed its iteration budget of {budget}")]
    BudgetExceeded { id: String, budget: u32 },

    #[error("Task {id} is {status}; only completed or failed tasks can be archived")]
    NotTerminal { id: String, status: TaskStatus },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for QueueError {
    fn from(e: rusqlite::Error) -> Self {
        QueueError::Store(StoreError::Sqlite(e))
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(e: serde_json::Error) -> Self {
        QueueError::Store(StoreError::Json(e))
    }
}

/// Errors from the session state store.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No session record for task {task_id}")]
    NotFound { task_id: String },

    #[error("Task {task_id} has no session segment {index}")]
    SegmentNotFound { task_id: String, index: u32 },

    #[error("Session I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt session file at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize session record: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Session store task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Errors from invoking the worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Failed to spawn worker command '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker unavailable: {0}")]
    Unavailable(String),
}

/// Errors from the verification engine. Both variants are transient
/// infrastructure failures and never count as a FAIL verdict.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("Verification engine unavailable: {0}")]
    Unavailable(String),

    #[error("Verification timed out after {secs}s")]
    Timeout { secs: u64 },
}

/// Errors from the human escalation protocol.
#[derive(Debug, Error)]
pub enum EscalationError {
    #[error("Decision request {request_id} not found")]
    RequestNotFound { request_id: i64 },

    #[error("Task {task_id} has no open decision request")]
    NoOpenRequest { task_id: String },

    #[error("Decision request {request_id} is already resolved")]
    AlreadyResolved { request_id: i64 },

    #[error("Task {task_id} is {status}; expected blocked")]
    NotBlocked { task_id: String, status: TaskStatus },

    #[error("Timed out waiting for decision on request {request_id}")]
    WaitTimeout { request_id: i64 },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for EscalationError {
    fn from(e: rusqlite::Error) -> Self {
        EscalationError::Store(StoreError::Sqlite(e))
    }
}

impl From<serde_json::Error> for EscalationError {
    fn from(e: serde_json::Error) -> Self {
        EscalationError::Store(StoreError::Json(e))
    }
}

/// Errors that end a task-run without a recorded transition.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Task {id} is {status} and cannot be run")]
    NotRunnable { id: String, status: TaskStatus },

    #[error("Task-run for {id} has already finished")]
    Finished { id: String },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Escalation(#[from] EscalationError),
}

/// Whether repeating the same call may succeed.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        use rusqlite::ErrorCode;
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::DiskFull
                    | ErrorCode::CannotOpen
                    | ErrorCode::FileLockingProtocolFailed
            ),
            StoreError::Open { .. } | StoreError::Join(_) => true,
            _ => false,
        }
    }
}

impl Transient for QueueError {
    fn is_transient(&self) -> bool {
        matches!(self, QueueError::Store(e) if e.is_transient())
    }
}

impl Transient for SessionError {
    fn is_transient(&self) -> bool {
        matches!(self, SessionError::Io { .. } | SessionError::Join(_))
    }
}

impl Transient for EscalationError {
    fn is_transient(&self) -> bool {
        match self {
            EscalationError::Queue(e) => e.is_transient(),
            EscalationError::Session(e) => e.is_transient(),
            EscalationError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Classification of a non-PASS iteration outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeClass {
    /// Malformed task or dependency cycle; rejected at enqueue.
    Validation,
    /// Verifier or worker unreachable; retried without consuming budget.
    TransientInfra,
    /// FAIL verdict; retried within budget.
    RegressionFailure,
    /// BLOCKED verdict; escalated immediately.
    GuardrailViolation,
    /// Budget ran out; escalated.
    BudgetExhausted,
}

impl OutcomeClass {
    /// Class of a verdict, `None` for PASS.
    pub fn of_verdict(verdict: &Verdict) -> Option<Self> {
        match verdict.kind {
            VerdictKind::Pass => None,
            VerdictKind::Fail => Some(Self::RegressionFailure),
            VerdictKind::Blocked => Some(Self::GuardrailViolation),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::TransientInfra => "transient_infra",
            Self::RegressionFailure => "regression_failure",
            Self::GuardrailViolation => "guardrail_violation",
            Self::BudgetExhausted => "budget_exhausted",
        }
    }
}

impl std::fmt::Display for OutcomeClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
