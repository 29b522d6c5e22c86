//! Change tracking for worker iterations: snapshot the work tree before the
//! worker runs, list what it touched, and put it back when a human approves
//! reverting a blocked change.

pub mod git;

pub use git::GitTracker;

use std::path::PathBuf;

use async_trait::async_trait;
use ratchet_common::ChangeSet;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Git operation failed: {0}")]
    Git(#[from] git2::Error),

    #[error("{0} is a bare repository")]
    Bare(PathBuf),

    #[error("Failed to remove {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Tracker task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Undoes the artifacts a task's last iteration changed.
#[async_trait]
pub trait ChangeReverter: Send + Sync {
    async fn revert(&self, task_id: &str, change_set: &ChangeSet) -> Result<(), TrackerError>;
}

/// Reverter for setups without a repository; leaves the files alone.
pub struct NoopReverter;

#[async_trait]
impl ChangeReverter for NoopReverter {
    async fn revert(&self, task_id: &str, change_set: &ChangeSet) -> Result<(), TrackerError> {
        debug!(
            task_id,
            artifacts = change_set.artifacts.len(),
            "no reverter configured, leaving change set in place"
        );
        Ok(())
    }
}

/// Restores changed artifacts from the snapshot the iteration started from.
pub struct GitReverter {
    project_dir: PathBuf,
}

impl GitReverter {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
        }
    }
}

#[async_trait]
impl ChangeReverter for GitReverter {
    async fn revert(&self, task_id: &str, change_set: &ChangeSet) -> Result<(), TrackerError> {
        let Some(base) = change_set.base_ref.clone() else {
            debug!(task_id, "change set has no base snapshot, nothing to revert");
            return Ok(());
        };
        let artifacts = change_set.artifacts.clone();
        let dir = self.project_dir.clone();
        let count = artifacts.len();
        tokio::task::spawn_blocking(move || {
            let tracker = GitTracker::new(&dir)?;
            tracker.restore(&base, &artifacts)
        })
        .await??;
        info!(task_id, artifacts = count, "reverted change set");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_git_reverter_restores_snapshot() {
        let dir = tempdir().unwrap();
        git2::Repository::init(dir.path()).unwrap();
        fs::write(dir.path().join("schema.sql"), "create table t;\n").unwrap();
        let tracker = GitTracker::new(dir.path()).unwrap();
        let base = tracker.snapshot("deploy-002-1").unwrap();

        fs::write(dir.path().join("schema.sql"), "drop table t;\n").unwrap();
        let change_set = ChangeSet {
            artifacts: tracker.changed_since(&base).unwrap(),
            base_ref: Some(base),
        };
        assert_eq!(change_set.artifacts, vec![PathBuf::from("schema.sql")]);

        GitReverter::new(dir.path())
            .revert("deploy-002", &change_set)
            .await
            .unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("schema.sql")).unwrap(),
            "create table t;\n"
        );
    }

    #[tokio::test]
    async fn test_reverters_accept_empty_change_set() {
        let dir = tempdir().unwrap();
        let empty = ChangeSet::default();
        NoopReverter.revert("t1", &empty).await.unwrap();
        GitReverter::new(dir.path()).revert("t1", &empty).await.unwrap();
    }
}
