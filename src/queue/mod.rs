//! Work queue: durable task records, dependency ordering and the checkpoint
//! streams.
//!
//! `WorkQueue` is the async face used by the controller, escalation protocol
//! and driver. It hands each call to the blocking pool through `DbHandle`;
//! the SQL itself lives in `store`.

pub mod graph;
pub(crate) mod store;

use std::time::Duration;

use ratchet_common::{Checkpoint, NewTask, Task, TaskStatus, reasons};
use serde::Serialize;

use crate::db::DbHandle;
use crate::errors::QueueError;
use store::StatusUpdate;

/// Status change applied together with a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChange {
    /// Stay in progress (RETRY); renews the lease.
    Continue,
    Complete,
    Block { reason: String },
    Fail { reason: String },
    /// Back to pending with no owner (cancellation between iterations).
    Release,
}

impl StatusChange {
    pub fn target(&self) -> TaskStatus {
        match self {
            Self::Continue => TaskStatus::InProgress,
            Self::Complete => TaskStatus::Completed,
            Self::Block { .. } => TaskStatus::Blocked,
            Self::Fail { .. } => TaskStatus::Failed,
            Self::Release => TaskStatus::Pending,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Block { reason } | Self::Fail { reason } => Some(reason),
            Self::Release => Some(reasons::CANCELLED),
            Self::Continue | Self::Complete => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub blocked: usize,
    pub completed: usize,
    pub failed: usize,
    pub archived: usize,
}

impl StatusCounts {
    /// Tasks that could still make progress without a human.
    pub fn active(&self) -> usize {
        self.pending + self.in_progress
    }
}

#[derive(Clone, Debug)]
pub struct WorkQueue {
    db: DbHandle,
    lease: Duration,
}

impl WorkQueue {
    pub fn new(db: DbHandle, lease: Duration) -> Self {
        Self { db, lease }
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Validate and insert a task. Rejected tasks never enter the queue.
    pub async fn enqueue(&self, task: NewTask) -> Result<Task, QueueError> {
        self.db.call(move |db| db.enqueue(&task)).await
    }

    /// Claim the highest-priority ready task for `owner`, or `None` when
    /// nothing is ready or `ceiling` tasks are already in progress.
    pub async fn dequeue_ready(&self, owner: &str, ceiling: usize) -> Result<Option<Task>, QueueError> {
        let owner = owner.to_string();
        let lease = self.lease;
        self.db
            .call(move |db| db.dequeue_ready(&owner, ceiling, lease))
            .await
    }

    pub async fn claim_resumed(&self, owner: &str) -> Result<Option<Task>, QueueError> {
        let owner = owner.to_string();
        let lease = self.lease;
        self.db.call(move |db| db.claim_resumed(&owner, lease)).await
    }

    /// Append `checkpoint` and apply `change` in one transaction.
    pub async fn record_transition(
        &self,
        owner: &str,
        checkpoint: Checkpoint,
        change: StatusChange,
    ) -> Result<Task, QueueError> {
        let owner = owner.to_string();
        let lease = self.lease;
        self.db
            .call(move |db| db.record_transition(&owner, &checkpoint, &change, lease))
            .await
    }

    pub async fn record_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), QueueError> {
        self.db.call(move |db| db.record_checkpoint(&checkpoint)).await
    }

    pub async fn mark_complete(&self, id: &str, owner: &str) -> Result<Task, QueueError> {
        self.set_status(id, owner, TaskStatus::Completed, None).await
    }

    pub async fn mark_blocked(&self, id: &str, owner: &str, reason: &str) -> Result<Task, QueueError> {
        self.set_status(id, owner, TaskStatus::Blocked, Some(reason.to_string()))
            .await
    }

    pub async fn mark_failed(&self, id: &str, owner: &str, reason: &str) -> Result<Task, QueueError> {
        self.set_status(id, owner, TaskStatus::Failed, Some(reason.to_string()))
            .await
    }

    /// in_progress -> pending without a checkpoint, for a task that was
    /// claimed but never started.
    pub async fn release(&self, id: &str, owner: &str) -> Result<Task, QueueError> {
        self.set_status(id, owner, TaskStatus::Pending, Some(reasons::CANCELLED.to_string()))
            .await
    }

    async fn set_status(
        &self,
        id: &str,
        owner: &str,
        to: TaskStatus,
        reason: Option<String>,
    ) -> Result<Task, QueueError> {
        let id = id.to_string();
        let owner = owner.to_string();
        self.db
            .call(move |db| {
                let update = StatusUpdate::new(&id, TaskStatus::InProgress, to)
                    .owned_by(&owner)
                    .reason(reason.as_deref());
                db.set_status(&update)
            })
            .await
    }

    pub async fn renew_lease(&self, id: &str, owner: &str) -> Result<bool, QueueError> {
        let id = id.to_string();
        let owner = owner.to_string();
        let lease = self.lease;
        self.db.call(move |db| db.renew_lease(&id, &owner, lease)).await
    }

    pub async fn reap_expired_leases(&self) -> Result<Vec<String>, QueueError> {
        self.db.call(|db| db.reap_expired_leases()).await
    }

    /// Look a task up in the active table, then the archive.
    pub async fn get(&self, id: &str) -> Result<Option<Task>, QueueError> {
        let id = id.to_string();
        self.db.call(move |db| db.get_task(&id)).await
    }

    pub async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, QueueError> {
        self.db.call(move |db| db.list_tasks(status)).await
    }

    pub async fn list_archived(&self) -> Result<Vec<Task>, QueueError> {
        self.db.call(|db| db.list_archived_tasks()).await
    }

    pub async fn checkpoints(&self, id: &str) -> Result<Vec<Checkpoint>, QueueError> {
        let id = id.to_string();
        self.db.call(move |db| db.checkpoints(&id)).await
    }

    pub async fn last_checkpoint(&self, id: &str) -> Result<Option<Checkpoint>, QueueError> {
        let id = id.to_string();
        self.db.call(move |db| db.last_checkpoint(&id)).await
    }

    pub async fn counts(&self) -> Result<StatusCounts, QueueError> {
        self.db.call(|db| db.status_counts()).await
    }

    pub async fn archive(&self, id: &str) -> Result<Task, QueueError> {
        let id = id.to_string();
        self.db.call(move |db| db.archive_task(&id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use ratchet_common::{Transition, ValidationError, Verdict};
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};

    type Result<T> = std::result::Result<T, QueueError>;

    const LEASE: Duration = Duration::from_secs(60);

    fn queue() -> WorkQueue {
        let db = Database::new_in_memory().expect("in-memory db");
        WorkQueue::new(DbHandle::new(db), LEASE)
    }

    fn task(id: &str) -> NewTask {
        NewTask::new(id, format!("work on {}", id), 5, "DONE")
    }

    fn retry_checkpoint(id: &str, iteration: u32) -> Checkpoint {
        Checkpoint::new(id, iteration, Transition::Retry).with_verdict(Verdict::fail("lint"))
    }

    #[tokio::test]
    async fn test_enqueue_and_get() -> Result<()> {
        let q = queue();
        let t = q.enqueue(task("a").with_priority(3)).await?;
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.session_ref, "task:a");
        assert_eq!(t.retry_count, 0);
        assert_eq!(q.get("a").await?.map(|t| t.priority), Some(3));
        Ok(())
    }

    #[tokio::test]
    async fn test_enqueue_rejects_invalid_tasks() -> Result<()> {
        let q = queue();
        let err = q.enqueue(NewTask::new("a", "x", 0, "DONE")).await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::Validation(ValidationError::NonPositiveBudget { .. })
        ));
        q.enqueue(task("a")).await?;
        let err = q.enqueue(task("a")).await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::Validation(ValidationError::DuplicateId { .. })
        ));
        assert_eq!(q.list(None).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_enqueue_rejects_cycle_through_forward_reference() -> Result<()> {
        let q = queue();
        q.enqueue(task("a").with_dependencies(["c"])).await?;
        q.enqueue(task("b").with_dependencies(["a"])).await?;
        let err = q.enqueue(task("c").with_dependencies(["b"])).await.unwrap_err();
        match err {
            QueueError::Validation(ValidationError::Cycle { path }) => {
                assert!(path.contains(&"c".to_string()));
            }
            other => panic!("Expected cycle, got {:?}", other),
        }
        assert!(q.get("c").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_dequeue_orders_by_priority_then_fifo() -> Result<()> {
        let q = queue();
        q.enqueue(task("low")).await?;
        q.enqueue(task("high-1").with_priority(5)).await?;
        q.enqueue(task("high-2").with_priority(5)).await?;

        let order: Vec<String> = {
            let mut v = Vec::new();
            while let Some(t) = q.dequeue_ready("driver", 10).await? {
                v.push(t.id);
            }
            v
        };
        assert_eq!(order, vec!["high-1", "high-2", "low"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_dependency_blocks_dispatch_until_completed() -> Result<()> {
        let q = queue();
        q.enqueue(task("a")).await?;
        q.enqueue(task("b").with_dependencies(["a"]).with_priority(10)).await?;

        let first = q.dequeue_ready("d", 10).await?.expect("a is ready");
        assert_eq!(first.id, "a");
        assert!(q.dequeue_ready("d", 10).await?.is_none(), "b must wait for a");

        q.record_transition(
            "d",
            Checkpoint::new("a", 1, Transition::Completed).with_verdict(Verdict::pass("ok")),
            StatusChange::Complete,
        )
        .await?;
        let next = q.dequeue_ready("d", 10).await?.expect("b is ready");
        assert_eq!(next.id, "b");
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_dependency_never_dispatches_dependent() -> Result<()> {
        let q = queue();
        q.enqueue(task("a")).await?;
        q.enqueue(task("b").with_dependencies(["a"])).await?;
        q.dequeue_ready("d", 10).await?;
        q.mark_failed("a", "d", "gave up").await?;
        assert!(q.dequeue_ready("d", 10).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_forward_reference_waits_for_dependency() -> Result<()> {
        let q = queue();
        q.enqueue(task("b").with_dependencies(["a"])).await?;
        assert!(q.dequeue_ready("d", 10).await?.is_none());
        q.enqueue(task("a")).await?;
        assert_eq!(q.dequeue_ready("d", 10).await?.map(|t| t.id), Some("a".into()));
        Ok(())
    }

    #[tokio::test]
    async fn test_ceiling_is_respected() -> Result<()> {
        let q = queue();
        for id in ["a", "b", "c"] {
            q.enqueue(task(id)).await?;
        }
        assert!(q.dequeue_ready("d", 2).await?.is_some());
        assert!(q.dequeue_ready("d", 2).await?.is_some());
        assert!(q.dequeue_ready("d", 2).await?.is_none());
        assert_eq!(q.counts().await?.in_progress, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_pending_cannot_complete_directly() -> Result<()> {
        let q = queue();
        q.enqueue(task("a")).await?;
        let err = q.mark_complete("a", "d").await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidTransition {
                from: TaskStatus::Pending,
                to: TaskStatus::Completed,
                ..
            }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_transition_requires_owner() -> Result<()> {
        let q = queue();
        q.enqueue(task("a")).await?;
        q.dequeue_ready("driver-1", 10).await?;
        let err = q
            .record_transition("driver-2", retry_checkpoint("a", 1), StatusChange::Continue)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::NotOwner { .. }));
        assert!(q.checkpoints("a").await?.is_empty(), "rejected change leaves no checkpoint");
        Ok(())
    }

    #[tokio::test]
    async fn test_record_transition_tracks_retry_count() -> Result<()> {
        let q = queue();
        q.enqueue(task("a")).await?;
        q.dequeue_ready("d", 10).await?;
        q.record_transition("d", retry_checkpoint("a", 1), StatusChange::Continue)
            .await?;
        let t = q
            .record_transition("d", retry_checkpoint("a", 2), StatusChange::Continue)
            .await?;
        assert_eq!(t.retry_count, 2);
        assert_eq!(t.status, TaskStatus::InProgress);
        assert_eq!(t.owner.as_deref(), Some("d"));
        assert_eq!(q.checkpoints("a").await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_checkpoint_beyond_budget_is_rejected() -> Result<()> {
        let q = queue();
        q.enqueue(NewTask::new("a", "x", 1, "DONE")).await?;
        q.dequeue_ready("d", 10).await?;
        let err = q
            .record_transition("d", retry_checkpoint("a", 2), StatusChange::Continue)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::BudgetExceeded { budget: 1, .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_release_returns_task_to_pending() -> Result<()> {
        let q = queue();
        q.enqueue(task("a")).await?;
        q.dequeue_ready("d", 10).await?;
        let cp = Checkpoint::new("a", 0, Transition::Aborted).with_reason(reasons::CANCELLED);
        let t = q.record_transition("d", cp, StatusChange::Release).await?;
        assert_eq!(t.status, TaskStatus::Pending);
        assert!(t.owner.is_none());
        assert_eq!(t.status_reason.as_deref(), Some("cancelled"));
        assert!(q.checkpoints("a").await?[0].recoverable);
        Ok(())
    }

    #[tokio::test]
    async fn test_reaped_lease_is_claimable_once() -> Result<()> {
        let q = WorkQueue::new(
            DbHandle::new(Database::new_in_memory().expect("db")),
            Duration::ZERO,
        );
        q.enqueue(task("a")).await?;
        q.dequeue_ready("dead-driver", 10).await?;
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(q.reap_expired_leases().await?, vec!["a".to_string()]);
        let t = q.get("a").await?.expect("task");
        assert_eq!(t.status, TaskStatus::InProgress);
        assert!(t.owner.is_none());

        let claimed = q.claim_resumed("live-driver").await?.expect("claimable");
        assert_eq!(claimed.owner.as_deref(), Some("live-driver"));
        assert!(q.claim_resumed("other").await?.is_none());

        let err = q
            .record_transition("dead-driver", retry_checkpoint("a", 1), StatusChange::Continue)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::NotOwner { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_archive_moves_task_and_checkpoints() -> Result<()> {
        let q = queue();
        q.enqueue(task("a")).await?;
        q.enqueue(task("b").with_dependencies(["a"])).await?;
        q.dequeue_ready("d", 10).await?;
        let err = q.archive("a").await.unwrap_err();
        assert!(matches!(err, QueueError::NotTerminal { .. }));

        q.record_transition(
            "d",
            Checkpoint::new("a", 1, Transition::Completed).with_verdict(Verdict::pass("ok")),
            StatusChange::Complete,
        )
        .await?;
        q.archive("a").await?;

        assert!(q.list(None).await?.iter().all(|t| t.id != "a"));
        assert_eq!(q.list_archived().await?.len(), 1);
        assert_eq!(q.checkpoints("a").await?.len(), 1, "history survives archival");
        assert_eq!(q.get("a").await?.map(|t| t.status), Some(TaskStatus::Completed));
        assert_eq!(q.counts().await?.archived, 1);

        // An archived completed dependency still satisfies dependents.
        assert_eq!(q.dequeue_ready("d", 10).await?.map(|t| t.id), Some("b".into()));
        Ok(())
    }

    #[test]
    fn test_concurrent_dequeue_never_duplicates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("queue.db");
        {
            let mut db = Database::open(&path).expect("open");
            for i in 0..40 {
                db.enqueue(&task(&format!("t{:02}", i))).expect("enqueue");
            }
        }

        let workers = 8;
        let barrier = Arc::new(Barrier::new(workers));
        let handles: Vec<_> = (0..workers)
            .map(|w| {
                let path = path.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    // Separate connections, as separate driver processes would have.
                    let mut db = Database::open(&path).expect("open");
                    barrier.wait();
                    let mut got = Vec::new();
                    while let Some(t) = db
                        .dequeue_ready(&format!("w{}", w), 1000, LEASE)
                        .expect("dequeue")
                    {
                        got.push(t.id);
                    }
                    got
                })
            })
            .collect();

        let mut seen = HashSet::new();
        let mut total = 0;
        for h in handles {
            for id in h.join().expect("thread") {
                total += 1;
                assert!(seen.insert(id), "task dispatched twice");
            }
        }
        assert_eq!(total, 40);
    }
}
