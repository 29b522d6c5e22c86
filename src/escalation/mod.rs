//! Human escalation protocol.
//!
//! A task that cannot safely continue is blocked and gets a persisted
//! `DecisionRequest`. Exactly one resolution is accepted:
//!
//! | Decision | Task | Session |
//! |---|---|---|
//! | APPROVE | failed, last change set reverted | archived |
//! | OVERRIDE | in_progress, unowned until a driver claims it | trigger added to waivers |
//! | ABORT | failed | archived |
//!
//! Headless mode applies APPROVE with `actor = system`; the audit trail has
//! the same shape as a human decision.

pub(crate) mod store;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use ratchet_common::{
    Actor, Checkpoint, Decision, DecisionKind, DecisionRequest, RunPhase, SessionRecord, Task,
};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::errors::{EscalationError, SessionError};
use crate::queue::WorkQueue;
use crate::session::SessionStore;
use crate::tracker::ChangeReverter;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationMode {
    /// Requests wait for `ratchet resolve`.
    #[default]
    Interactive,
    /// Requests are approved immediately by the system.
    Headless,
}

impl EscalationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interactive => "interactive",
            Self::Headless => "headless",
        }
    }
}

impl fmt::Display for EscalationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EscalationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "interactive" => Ok(Self::Interactive),
            "headless" => Ok(Self::Headless),
            _ => Err(format!("Invalid escalation mode: {}", s)),
        }
    }
}

/// What a resolution did.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub request: DecisionRequest,
    pub decision: Decision,
    pub task: Task,
    /// Set when APPROVE could not revert the change set. The decision
    /// stands either way.
    pub revert_error: Option<String>,
}

#[derive(Clone)]
pub struct Escalation {
    queue: WorkQueue,
    sessions: Arc<dyn SessionStore>,
    reverter: Arc<dyn ChangeReverter>,
    mode: EscalationMode,
}

impl Escalation {
    pub fn new(
        queue: WorkQueue,
        sessions: Arc<dyn SessionStore>,
        reverter: Arc<dyn ChangeReverter>,
        mode: EscalationMode,
    ) -> Self {
        Self {
            queue,
            sessions,
            reverter,
            mode,
        }
    }

    pub fn mode(&self) -> EscalationMode {
        self.mode
    }

    /// Block the task and open a decision request, committing the ASK_HUMAN
    /// checkpoint in the same transaction.
    pub async fn escalate(
        &self,
        owner: &str,
        checkpoint: Checkpoint,
        reason: &str,
        evidence: Vec<String>,
    ) -> Result<DecisionRequest, EscalationError> {
        let owner = owner.to_string();
        let reason_owned = reason.to_string();
        let lease = self.queue.lease();
        let (task, request) = self
            .queue
            .db()
            .call(move |db| db.escalate(&owner, &checkpoint, &reason_owned, &evidence, lease))
            .await?;
        warn!(
            task_id = %task.id,
            request_id = request.id,
            iteration = request.iteration,
            reason,
            "task escalated, waiting for decision"
        );
        Ok(request)
    }

    /// In headless mode, approve `request` as the system. Returns `None` in
    /// interactive mode.
    pub async fn auto_resolve(
        &self,
        request: &DecisionRequest,
    ) -> Result<Option<Resolution>, EscalationError> {
        match self.mode {
            EscalationMode::Interactive => Ok(None),
            EscalationMode::Headless => self
                .resolve(
                    request.id,
                    DecisionKind::Approve,
                    Actor::System,
                    Some("headless mode"),
                )
                .await
                .map(Some),
        }
    }

    /// Accept the resolution of `request_id` and apply its effects.
    pub async fn resolve(
        &self,
        request_id: i64,
        kind: DecisionKind,
        actor: Actor,
        note: Option<&str>,
    ) -> Result<Resolution, EscalationError> {
        let note_owned = note.map(str::to_string);
        let (request, decision, task) = self
            .queue
            .db()
            .call(move |db| db.resolve(request_id, kind, actor, note_owned.as_deref()))
            .await?;

        info!(
            task_id = %task.id,
            request_id,
            decision = %kind,
            actor = %actor,
            "decision recorded"
        );

        let mut revert_error = None;
        match kind {
            DecisionKind::Override => self.apply_override(&task, &request).await?,
            DecisionKind::Approve => {
                revert_error = self.close_session(&task, &decision, true).await?;
            }
            DecisionKind::Abort => {
                self.close_session(&task, &decision, false).await?;
            }
        }

        Ok(Resolution {
            request,
            decision,
            task,
            revert_error,
        })
    }

    /// Resolve the open request of `task_id`.
    pub async fn resolve_task(
        &self,
        task_id: &str,
        kind: DecisionKind,
        actor: Actor,
        note: Option<&str>,
    ) -> Result<Resolution, EscalationError> {
        let request = self
            .request_for(task_id)
            .await?
            .ok_or_else(|| EscalationError::NoOpenRequest {
                task_id: task_id.to_string(),
            })?;
        self.resolve(request.id, kind, actor, note).await
    }

    async fn load_or_fresh(&self, task: &Task) -> Result<SessionRecord, SessionError> {
        match self.sessions.load(&task.id).await {
            Ok(record) => Ok(record),
            Err(SessionError::NotFound { .. }) => {
                let mut record = SessionRecord::fresh(&task.id);
                record.iteration_count = task.retry_count;
                Ok(record)
            }
            Err(e) => Err(e),
        }
    }

    async fn apply_override(
        &self,
        task: &Task,
        request: &DecisionRequest,
    ) -> Result<(), EscalationError> {
        let mut session = self.load_or_fresh(task).await?;
        if !session.waivers.contains(&request.reason) {
            session.waivers.push(request.reason.clone());
        }
        session.phase = RunPhase::Running;
        session.append_narrative(&format!(
            "override: resuming after iteration {} with '{}' waived",
            session.iteration_count, request.reason
        ));
        session.touch();
        self.sessions.save(&session).await?;
        Ok(())
    }

    /// Record the decision in the narrative, optionally revert the last
    /// change set, and archive the session.
    async fn close_session(
        &self,
        task: &Task,
        decision: &Decision,
        revert: bool,
    ) -> Result<Option<String>, EscalationError> {
        let mut session = self.load_or_fresh(task).await?;

        let mut revert_error = None;
        if revert && let Some(change_set) = session.last_change_set.as_ref() {
            if let Err(e) = self.reverter.revert(&task.id, change_set).await {
                warn!(task_id = %task.id, error = %e, "failed to revert change set");
                revert_error = Some(e.to_string());
            }
        }

        session.phase = RunPhase::Aborted;
        session.append_narrative(&format!(
            "decision: {} by {}",
            decision.kind, decision.actor
        ));
        session.touch();
        self.sessions.save(&session).await?;
        self.sessions.archive(&task.id).await?;
        Ok(revert_error)
    }

    pub async fn pending_requests(&self) -> Result<Vec<DecisionRequest>, EscalationError> {
        self.queue.db().call(|db| db.pending_requests()).await
    }

    /// The open request for `task_id`, if the task is waiting on one.
    pub async fn request_for(&self, task_id: &str) -> Result<Option<DecisionRequest>, EscalationError> {
        let task_id = task_id.to_string();
        self.queue
            .db()
            .call(move |db| db.open_request_for(&task_id))
            .await
    }

    pub async fn request(&self, request_id: i64) -> Result<Option<DecisionRequest>, EscalationError> {
        self.queue
            .db()
            .call(move |db| db.decision_request(request_id))
            .await
    }

    pub async fn requests_for(&self, task_id: &str) -> Result<Vec<DecisionRequest>, EscalationError> {
        let task_id = task_id.to_string();
        self.queue.db().call(move |db| db.requests_for(&task_id)).await
    }

    pub async fn decisions(&self, task_id: &str) -> Result<Vec<Decision>, EscalationError> {
        let task_id = task_id.to_string();
        self.queue
            .db()
            .call(move |db| db.decisions(Some(&task_id)))
            .await
    }

    pub async fn all_decisions(&self) -> Result<Vec<Decision>, EscalationError> {
        self.queue.db().call(|db| db.decisions(None)).await
    }

    /// Poll until `request_id` is resolved or `timeout` passes.
    pub async fn wait_for_resolution(
        &self,
        request_id: i64,
        poll: Duration,
        timeout: Duration,
    ) -> Result<DecisionRequest, EscalationError> {
        let deadline = Instant::now() + timeout;
        loop {
            let request = self
                .request(request_id)
                .await?
                .ok_or(EscalationError::RequestNotFound { request_id })?;
            if !request.is_open() {
                return Ok(request);
            }
            if Instant::now() >= deadline {
                return Err(EscalationError::WaitTimeout { request_id });
            }
            tokio::time::sleep(poll.min(deadline - Instant::now())).await;
        }
    }
}
