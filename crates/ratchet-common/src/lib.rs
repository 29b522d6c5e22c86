//! Shared domain types for the Ratchet task runner.
//!
//! Everything the work queue, session store, iteration controller and
//! escalation protocol exchange lives here so that adapters (workers,
//! verifiers, UIs) can depend on the vocabulary without pulling in storage.

pub mod checkpoint;
pub mod decision;
pub mod error;
pub mod session;
pub mod task;
pub mod verdict;

pub use checkpoint::{Checkpoint, Transition};
pub use decision::{Actor, Decision, DecisionKind, DecisionRequest};
pub use error::ValidationError;
pub use session::{ChangeSet, RunPhase, SessionRecord, SessionSegment};
pub use task::{NewTask, Task, TaskStatus, session_key};
pub use verdict::{Verdict, VerdictKind};

/// Well-known reason strings written into checkpoints and decision requests.
pub mod reasons {
    /// The iteration budget ran out without a PASS + sentinel outcome.
    pub const BUDGET_EXHAUSTED: &str = "budget_exhausted";
    /// Verification (or the worker process) stayed unreachable past the infra retries.
    pub const INFRA_EXHAUSTED: &str = "infra_exhausted";
    /// The worker exceeded the per-iteration wall-clock timeout.
    pub const TIMEOUT: &str = "timeout";
    /// Verification passed but the worker did not emit its completion sentinel.
    pub const SENTINEL_MISSING: &str = "sentinel_missing";
    /// The run was cancelled between iterations.
    pub const CANCELLED: &str = "cancelled";
    /// Trigger name for a BLOCKED verdict that gave no reason.
    pub const BLOCKED: &str = "blocked";
}
