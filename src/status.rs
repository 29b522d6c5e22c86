//! Human-facing status of a single task.

use anyhow::{Context, Result, anyhow};
use ratchet_common::{DecisionRequest, TaskStatus, Verdict};
use serde::Serialize;

use crate::errors::SessionError;
use crate::escalation::Escalation;
use crate::queue::WorkQueue;
use crate::session::FileSessionStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub task_id: String,
    pub status: TaskStatus,
    pub iteration_count: u32,
    pub iteration_budget: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_verdict: Option<Verdict>,
    pub next_steps: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// The request waiting on a human, while the task is blocked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_request: Option<DecisionRequest>,
    pub archived: bool,
}

/// Status of `task_id`, taking progress from its session when one exists.
pub async fn task_status(
    queue: &WorkQueue,
    sessions: &FileSessionStore,
    escalation: &Escalation,
    task_id: &str,
) -> Result<StatusReport> {
    let (task, archived) = match queue.get(task_id).await? {
        Some(task) => (task, false),
        None => queue
            .list_archived()
            .await?
            .into_iter()
            .find(|t| t.id == task_id)
            .map(|t| (t, true))
            .ok_or_else(|| anyhow!("Task '{}' not found", task_id))?,
    };

    let session = match sessions.load_any(task_id) {
        Ok(record) => Some(record),
        Err(SessionError::NotFound { .. }) => None,
        Err(e) => return Err(e).with_context(|| format!("Failed to load session for {}", task_id)),
    };
    let open_request = escalation.request_for(task_id).await?;

    let (iteration_count, last_verdict, next_steps) = match session {
        Some(s) => (s.iteration_count, s.last_verdict, s.next_steps),
        None => (task.retry_count, None, Vec::new()),
    };

    Ok(StatusReport {
        task_id: task.id,
        status: task.status,
        iteration_count,
        iteration_budget: task.iteration_budget,
        last_verdict,
        next_steps,
        status_reason: task.status_reason,
        owner: task.owner,
        open_request,
        archived,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, DbHandle};
    use crate::escalation::EscalationMode;
    use crate::session::SessionStore;
    use crate::tracker::NoopReverter;
    use ratchet_common::{Checkpoint, NewTask, SessionRecord, Transition};
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> (tempfile::TempDir, WorkQueue, Arc<FileSessionStore>, Escalation) {
        let dir = tempfile::tempdir().unwrap();
        let queue = WorkQueue::new(
            DbHandle::new(Database::new_in_memory().unwrap()),
            Duration::from_secs(60),
        );
        let sessions = Arc::new(FileSessionStore::new(dir.path().join("sessions"), 1 << 16, 2000));
        let escalation = Escalation::new(
            queue.clone(),
            sessions.clone(),
            Arc::new(NoopReverter),
            EscalationMode::Interactive,
        );
        (dir, queue, sessions, escalation)
    }

    #[tokio::test]
    async fn test_pending_task_without_session() {
        let (_dir, queue, sessions, escalation) = setup();
        queue.enqueue(NewTask::new("a", "do a", 4, "DONE")).await.unwrap();

        let report = task_status(&queue, &sessions, &escalation, "a").await.unwrap();
        assert_eq!(report.status, TaskStatus::Pending);
        assert_eq!(report.iteration_count, 0);
        assert_eq!(report.iteration_budget, 4);
        assert!(report.last_verdict.is_none());
        assert!(report.open_request.is_none());
    }

    #[tokio::test]
    async fn test_blocked_task_reports_session_and_request() {
        let (_dir, queue, sessions, escalation) = setup();
        queue.enqueue(NewTask::new("deploy", "ship", 5, "DONE")).await.unwrap();
        queue.dequeue_ready("w", 1).await.unwrap().unwrap();

        let mut record = SessionRecord::fresh("deploy");
        record.iteration_count = 1;
        record.last_verdict = Some(Verdict::blocked("irreversible SQL detected"));
        record.next_steps = vec!["split the migration".into()];
        sessions.save(&record).await.unwrap();

        let checkpoint = Checkpoint::new("deploy", 1, Transition::AskHuman)
            .with_verdict(Verdict::blocked("irreversible SQL detected"));
        escalation
            .escalate("w", checkpoint, "irreversible SQL detected", Vec::new())
            .await
            .unwrap();

        let report = task_status(&queue, &sessions, &escalation, "deploy").await.unwrap();
        assert_eq!(report.status, TaskStatus::Blocked);
        assert_eq!(report.iteration_count, 1);
        assert_eq!(report.next_steps, vec!["split the migration".to_string()]);
        assert_eq!(
            report.open_request.as_ref().map(|r| r.reason.as_str()),
            Some("irreversible SQL detected")
        );
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let (_dir, queue, sessions, escalation) = setup();
        let err = task_status(&queue, &sessions, &escalation, "ghost").await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
