//! Task records and the task status state machine.

use crate::error::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Coarse lifecycle status of a task in the work queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Blocked,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Completed and failed tasks never move again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self -> next` is an edge of the task state machine.
    ///
    /// ```text
    /// pending     -> in_progress
    /// in_progress -> completed | blocked | failed | pending
    /// blocked     -> in_progress | failed
    /// ```
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (InProgress, Completed)
                | (InProgress, Blocked)
                | (InProgress, Failed)
                | (InProgress, Pending)
                | (Blocked, InProgress)
                | (Blocked, Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "blocked" => Ok(Self::Blocked),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// Key under which a task's session record is stored.
pub fn session_key(task_id: &str) -> String {
    format!("task:{}", task_id)
}

/// A task submission from an external producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub iteration_budget: i64,
    pub completion_sentinel: String,
}

impl NewTask {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        iteration_budget: i64,
        completion_sentinel: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            priority: 0,
            dependencies: Vec::new(),
            iteration_budget,
            completion_sentinel: completion_sentinel.into(),
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Checks that need nothing but the submission itself.
    ///
    /// Graph-level checks (duplicates, cycles) happen in the queue against
    /// the full current dependency graph.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::EmptyId);
        }
        if self.description.trim().is_empty() {
            return Err(ValidationError::EmptyDescription {
                id: self.id.clone(),
            });
        }
        if self.completion_sentinel.trim().is_empty() {
            return Err(ValidationError::EmptySentinel {
                id: self.id.clone(),
            });
        }
        if self.iteration_budget <= 0 {
            return Err(ValidationError::NonPositiveBudget {
                id: self.id.clone(),
                budget: self.iteration_budget,
            });
        }
        if self.dependencies.iter().any(|d| d == &self.id) {
            return Err(ValidationError::SelfDependency {
                id: self.id.clone(),
            });
        }
        Ok(())
    }

    /// Dependencies with duplicates removed, in a stable order.
    pub fn unique_dependencies(&self) -> Vec<String> {
        self.dependencies
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// A task as stored by the work queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: i64,
    pub dependencies: Vec<String>,
    /// Iterations consumed so far; never exceeds `iteration_budget`.
    pub retry_count: u32,
    pub iteration_budget: u32,
    pub completion_sentinel: String,
    pub session_ref: String,
    /// Driver instance holding the in-progress lease.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Reason attached by the last blocked/failed transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    /// Insertion sequence, the FIFO tie-breaker for equal priorities.
    pub seq: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn budget_remaining(&self) -> u32 {
        self.iteration_budget.saturating_sub(self.retry_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrips_through_str() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Blocked,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("running".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn pending_cannot_jump_to_completed() {
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Blocked));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::InProgress));
    }

    #[test]
    fn terminal_states_are_final() {
        for next in [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Blocked,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert!(!TaskStatus::Completed.can_transition_to(next));
            assert!(!TaskStatus::Failed.can_transition_to(next));
        }
    }

    #[test]
    fn blocked_resumes_or_fails() {
        assert!(TaskStatus::Blocked.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::Blocked.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Blocked.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn validate_rejects_non_positive_budget() {
        let task = NewTask::new("t1", "do it", 0, "DONE");
        assert!(matches!(
            task.validate(),
            Err(ValidationError::NonPositiveBudget { budget: 0, .. })
        ));
        let task = NewTask::new("t1", "do it", -3, "DONE");
        assert!(task.validate().is_err());
    }

    #[test]
    fn validate_rejects_self_dependency() {
        let task = NewTask::new("t1", "do it", 3, "DONE").with_dependencies(["t1"]);
        assert_eq!(
            task.validate(),
            Err(ValidationError::SelfDependency { id: "t1".into() })
        );
    }

    #[test]
    fn validate_rejects_blank_fields() {
        assert_eq!(
            NewTask::new("  ", "x", 1, "DONE").validate(),
            Err(ValidationError::EmptyId)
        );
        assert!(matches!(
            NewTask::new("t", "", 1, "DONE").validate(),
            Err(ValidationError::EmptyDescription { .. })
        ));
        assert!(matches!(
            NewTask::new("t", "x", 1, " ").validate(),
            Err(ValidationError::EmptySentinel { .. })
        ));
    }

    #[test]
    fn unique_dependencies_dedups() {
        let task = NewTask::new("t", "x", 1, "DONE").with_dependencies(["b", "a", "b"]);
        assert_eq!(task.unique_dependencies(), vec!["a", "b"]);
    }

    #[test]
    fn session_key_format() {
        assert_eq!(session_key("fix-lint-001"), "task:fix-lint-001");
    }
}
