//! Audit trail: a replayable JSON export of every task's checkpoint stream
//! and decisions, plus per-run driver logs under `.ratchet/audit/runs`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ratchet_common::{Checkpoint, Decision, DecisionRequest, SessionRecord, Task};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::escalation::Escalation;
use crate::errors::SessionError;
use crate::queue::WorkQueue;
use crate::session::FileSessionStore;

pub mod logger;
pub use logger::{AuditLogger, RunConfig, RunEvent, RunLog};

/// Everything recorded for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTimeline {
    pub task: Task,
    #[serde(default)]
    pub archived: bool,
    pub checkpoints: Vec<Checkpoint>,
    pub requests: Vec<DecisionRequest>,
    pub decisions: Vec<Decision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionRecord>,
}

/// One line of a flattened timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub at: DateTime<Utc>,
    pub label: String,
    pub detail: String,
}

impl TaskTimeline {
    /// Checkpoints, requests and decisions merged in time order. Ties keep
    /// that order, which is also the order they are written in.
    pub fn entries(&self) -> Vec<TimelineEntry> {
        let mut entries = Vec::new();
        entries.push(TimelineEntry {
            at: self.task.created_at,
            label: "enqueued".to_string(),
            detail: format!(
                "budget {}, priority {}",
                self.task.iteration_budget, self.task.priority
            ),
        });
        for cp in &self.checkpoints {
            let mut detail = format!("iteration {}", cp.iteration);
            if let Some(verdict) = &cp.verdict {
                detail.push_str(&format!(" {} \"{}\"", verdict.kind.as_str(), verdict.reason));
            }
            if let Some(reason) = &cp.reason {
                detail.push_str(&format!(" ({})", reason));
            }
            entries.push(TimelineEntry {
                at: cp.timestamp,
                label: cp.transition.as_str().to_string(),
                detail,
            });
        }
        for req in &self.requests {
            entries.push(TimelineEntry {
                at: req.created_at,
                label: format!("request #{}", req.id),
                detail: format!("{} at iteration {}", req.reason, req.iteration),
            });
        }
        for decision in &self.decisions {
            let mut detail = format!("by {}", decision.actor.as_str());
            if let Some(note) = &decision.note {
                detail.push_str(&format!(": {}", note));
            }
            entries.push(TimelineEntry {
                at: decision.timestamp,
                label: decision.kind.as_str().to_string(),
                detail,
            });
        }
        entries.sort_by_key(|e| e.at);
        entries
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditExport {
    pub exported_at: DateTime<Utc>,
    pub project_dir: PathBuf,
    pub tasks: Vec<TaskTimeline>,
}

impl AuditExport {
    /// Gather the timeline of every task, active and archived.
    pub async fn collect(
        project_dir: &Path,
        queue: &WorkQueue,
        escalation: &Escalation,
        sessions: &FileSessionStore,
    ) -> Result<Self> {
        let mut tasks = Vec::new();
        let active = queue.list(None).await.context("Failed to list tasks")?;
        let archived = queue
            .list_archived()
            .await
            .context("Failed to list archived tasks")?;

        for (task, archived) in active
            .into_iter()
            .map(|t| (t, false))
            .chain(archived.into_iter().map(|t| (t, true)))
        {
            tasks.push(timeline(task, archived, queue, escalation, sessions).await?);
        }

        Ok(Self {
            exported_at: Utc::now(),
            project_dir: project_dir.to_path_buf(),
            tasks,
        })
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskTimeline> {
        self.tasks.iter().find(|t| t.task.id == task_id)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize audit export")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write audit export: {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read audit export: {}", path.display()))?;
        serde_json::from_str(&content).context("Failed to parse audit export")
    }
}

/// Timeline for a single task.
pub async fn timeline(
    task: Task,
    archived: bool,
    queue: &WorkQueue,
    escalation: &Escalation,
    sessions: &FileSessionStore,
) -> Result<TaskTimeline> {
    let checkpoints = queue
        .checkpoints(&task.id)
        .await
        .with_context(|| format!("Failed to read checkpoints for {}", task.id))?;
    let requests = escalation.requests_for(&task.id).await?;
    let decisions = escalation.decisions(&task.id).await?;
    let session = match sessions.load_any(&task.id) {
        Ok(record) => Some(record),
        Err(SessionError::NotFound { .. }) => None,
        Err(e) => return Err(e).with_context(|| format!("Failed to load session for {}", task.id)),
    };
    Ok(TaskTimeline {
        task,
        archived,
        checkpoints,
        requests,
        decisions,
        session,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, DbHandle};
    use crate::escalation::EscalationMode;
    use crate::queue::StatusChange;
    use crate::tracker::NoopReverter;
    use ratchet_common::{Actor, DecisionKind, NewTask, Transition, Verdict};
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        dir: tempfile::TempDir,
        queue: WorkQueue,
        sessions: Arc<FileSessionStore>,
        escalation: Escalation,
    }

    fn fixture() -> Fixture {
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
        Fixture {
            dir,
            queue,
            sessions,
            escalation,
        }
    }

    #[tokio::test]
    async fn test_collect_includes_checkpoints_and_decisions() {
        let f = fixture();
        f.queue
            .enqueue(NewTask::new("deploy-002", "ship the migration", 5, "DONE"))
            .await
            .unwrap();
        f.queue.enqueue(NewTask::new("idle", "untouched", 5, "DONE")).await.unwrap();
        let task = f.queue.dequeue_ready("w", 4).await.unwrap().unwrap();
        assert_eq!(task.id, "deploy-002");

        let checkpoint = Checkpoint::new("deploy-002", 1, Transition::AskHuman)
            .with_verdict(Verdict::blocked("irreversible SQL detected"));
        let request = f
            .escalation
            .escalate("w", checkpoint, "irreversible SQL detected", Vec::new())
            .await
            .unwrap();
        f.escalation
            .resolve(request.id, DecisionKind::Override, Actor::Human, Some("reviewed"))
            .await
            .unwrap();

        let export = AuditExport::collect(f.dir.path(), &f.queue, &f.escalation, &f.sessions)
            .await
            .unwrap();
        assert_eq!(export.tasks.len(), 2);

        let deploy = export.task("deploy-002").unwrap();
        assert_eq!(deploy.checkpoints.len(), 1);
        assert_eq!(deploy.requests.len(), 1);
        assert_eq!(deploy.decisions.len(), 1);
        assert_eq!(deploy.decisions[0].kind, DecisionKind::Override);

        let labels: Vec<_> = deploy.entries().into_iter().map(|e| e.label).collect();
        assert_eq!(labels.first().map(String::as_str), Some("enqueued"));
        assert!(labels.contains(&"OVERRIDE".to_string()));

        assert!(deploy.session.as_ref().unwrap().waivers.contains(&"irreversible SQL detected".to_string()));

        let idle = export.task("idle").unwrap();
        assert!(idle.checkpoints.is_empty());
        assert!(idle.session.is_none());
    }

    #[tokio::test]
    async fn test_collect_marks_archived_tasks() {
        let f = fixture();
        f.queue.enqueue(NewTask::new("a", "first", 2, "DONE")).await.unwrap();
        f.queue.dequeue_ready("w", 1).await.unwrap().unwrap();
        let cp = Checkpoint::new("a", 1, Transition::Completed).with_verdict(Verdict::pass("ok"));
        f.queue
            .record_transition("w", cp, StatusChange::Complete)
            .await
            .unwrap();
        f.queue.archive("a").await.unwrap();

        let export = AuditExport::collect(f.dir.path(), &f.queue, &f.escalation, &f.sessions)
            .await
            .unwrap();
        let a = export.task("a").unwrap();
        assert!(a.archived);
        assert_eq!(a.checkpoints.len(), 1);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let f = fixture();
        f.queue.enqueue(NewTask::new("a", "first", 2, "DONE")).await.unwrap();
        let export = AuditExport::collect(f.dir.path(), &f.queue, &f.escalation, &f.sessions)
            .await
            .unwrap();

        let path = f.dir.path().join("audit.json");
        export.save(&path).unwrap();
        assert_eq!(AuditExport::load(&path).unwrap(), export);
    }
}
