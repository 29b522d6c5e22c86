//! Worker contract and the shell-command adapter.
//!
//! The worker does the actual task work. It sees only a reconstructed
//! context (description, narrative summary, next steps), never the full
//! iteration history, so a resumed run hands it exactly what an
//! uninterrupted run would have.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::errors::WorkerError;
use crate::tracker::GitTracker;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInput {
    pub task_id: String,
    pub description: String,
    /// Bounded tail of the session narrative.
    pub summary: String,
    pub next_steps: Vec<String>,
    /// 1-based number of the iteration about to run.
    pub iteration: u32,
    pub iteration_budget: u32,
    pub completion_sentinel: String,
}

impl WorkerInput {
    pub fn prompt(&self) -> String {
        let mut prompt = format!("# Task {}\n\n{}\n\n", self.task_id, self.description.trim());

        prompt.push_str("## Progress so far\n\n");
        if self.summary.trim().is_empty() {
            prompt.push_str("Nothing yet. This is the first attempt.\n\n");
        } else {
            prompt.push_str(self.summary.trim_end());
            prompt.push_str("\n\n");
        }

        if !self.next_steps.is_empty() {
            prompt.push_str("## Next steps\n\n");
            for step in &self.next_steps {
                prompt.push_str(&format!("- {}\n", step));
            }
            prompt.push('\n');
        }

        prompt.push_str(&format!(
            "## Instructions\n\n\
             This is iteration {} of {}.\n\
             When the task is fully done, print `{}` on a line by itself.\n\
             List what remains inside <next>...</next>, one step per line.\n",
            self.iteration, self.iteration_budget, self.completion_sentinel
        ));
        prompt
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerOutput {
    pub text: String,
    pub changed_artifacts: Vec<PathBuf>,
    /// Snapshot the work tree was at before the worker ran.
    pub base_ref: Option<String>,
}

#[async_trait]
pub trait Worker: Send + Sync {
    async fn run(&self, input: &WorkerInput) -> Result<WorkerOutput, WorkerError>;

    /// True when every run edits one shared work tree and attributes changes
    /// by diffing it, so concurrent runs would see each other's files.
    fn shares_work_tree(&self) -> bool {
        false
    }
}

/// Spawns `sh -c <command>` in the project directory with the prompt on
/// stdin. Stdout becomes the output text; prompt and output are kept under
/// the log directory. When the project is a git repository the changed
/// artifacts come from a snapshot diff.
pub struct CommandWorker {
    command: String,
    project_dir: PathBuf,
    log_dir: PathBuf,
    track_changes: bool,
}

impl CommandWorker {
    pub fn new(command: impl Into<String>, project_dir: &Path, log_dir: &Path) -> Self {
        let track_changes = GitTracker::new(project_dir).is_ok();
        if !track_changes {
            warn!(
                project_dir = %project_dir.display(),
                "not a git repository, changed artifacts will not be tracked"
            );
        }
        Self {
            command: command.into(),
            project_dir: project_dir.to_path_buf(),
            log_dir: log_dir.to_path_buf(),
            track_changes,
        }
    }

    async fn snapshot(&self, label: String) -> Option<String> {
        if !self.track_changes {
            return None;
        }
        let dir = self.project_dir.clone();
        let result =
            tokio::task::spawn_blocking(move || GitTracker::new(&dir)?.snapshot(&label)).await;
        match result {
            Ok(Ok(sha)) => Some(sha),
            Ok(Err(e)) => {
                warn!(error = %e, "snapshot failed");
                None
            }
            Err(e) => {
                warn!(error = %e, "snapshot task failed");
                None
            }
        }
    }

    async fn changed_since(&self, base: &str) -> Vec<PathBuf> {
        let dir = self.project_dir.clone();
        let base = base.to_string();
        let result =
            tokio::task::spawn_blocking(move || GitTracker::new(&dir)?.changed_since(&base)).await;
        match result {
            Ok(Ok(changed)) => changed,
            Ok(Err(e)) => {
                warn!(error = %e, "failed to diff against snapshot");
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, "diff task failed");
                Vec::new()
            }
        }
    }

    fn log_path(&self, input: &WorkerInput, kind: &str) -> PathBuf {
        let safe_id = crate::session::encode_key(&input.task_id);
        self.log_dir
            .join(format!("{}-iter-{}-{}.log", safe_id, input.iteration, kind))
    }
}

#[async_trait]
impl Worker for CommandWorker {
    async fn run(&self, input: &WorkerInput) -> Result<WorkerOutput, WorkerError> {
        let prompt = input.prompt();
        tokio::fs::create_dir_all(&self.log_dir).await?;
        tokio::fs::write(self.log_path(input, "prompt"), &prompt).await?;

        let base_ref = self
            .snapshot(format!("{} iteration {}", input.task_id, input.iteration))
            .await;

        debug!(
            task_id = %input.task_id,
            iteration = input.iteration,
            command = %self.command,
            "spawning worker"
        );

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.project_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("RATCHET_TASK_ID", &input.task_id)
            .env("RATCHET_ITERATION", input.iteration.to_string())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkerError::SpawnFailed {
                command: self.command.clone(),
                source: e,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(prompt.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);

        let mut log = stdout.clone();
        if !stderr.trim().is_empty() {
            log.push_str("\n--- stderr ---\n");
            log.push_str(&stderr);
        }
        tokio::fs::write(self.log_path(input, "output"), &log).await?;

        if !output.status.success() {
            warn!(
                task_id = %input.task_id,
                iteration = input.iteration,
                exit_code = output.status.code().unwrap_or(-1),
                "worker exited unsuccessfully"
            );
        }

        let changed_artifacts = match &base_ref {
            Some(base) => self.changed_since(base).await,
            None => Vec::new(),
        };

        Ok(WorkerOutput {
            text: stdout,
            changed_artifacts,
            base_ref,
        })
    }

    fn shares_work_tree(&self) -> bool {
        self.track_changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn input() -> WorkerInput {
        WorkerInput {
            task_id: "fix-lint-001".into(),
            description: "Fix clippy warnings in src/".into(),
            summary: String::new(),
            next_steps: vec![],
            iteration: 1,
            iteration_budget: 5,
            completion_sentinel: "TASK COMPLETE".into(),
        }
    }

    #[test]
    fn test_prompt_first_iteration() {
        let prompt = input().prompt();
        assert!(prompt.starts_with("# Task fix-lint-001\n\nFix clippy warnings in src/"));
        assert!(prompt.contains("first attempt"));
        assert!(prompt.contains("iteration 1 of 5"));
        assert!(prompt.contains("`TASK COMPLETE`"));
        assert!(!prompt.contains("## Next steps"));
    }

    #[test]
    fn test_prompt_includes_summary_and_next_steps() {
        let mut input = input();
        input.summary = "iteration 1: FAIL unused import\n".into();
        input.next_steps = vec!["remove unused import".into()];
        input.iteration = 2;
        let prompt = input.prompt();
        assert!(prompt.contains("iteration 1: FAIL unused import"));
        assert!(prompt.contains("## Next steps\n\n- remove unused import\n"));
        assert!(prompt.contains("iteration 2 of 5"));
    }

    #[tokio::test]
    async fn test_command_worker_captures_output_and_logs() {
        let dir = tempdir().unwrap();
        let logs = dir.path().join("logs");
        let worker = CommandWorker::new("head -n 1; echo TASK COMPLETE", dir.path(), &logs);
        let output = worker.run(&input()).await.unwrap();

        assert!(output.text.contains("# Task fix-lint-001"));
        assert!(output.text.contains("TASK COMPLETE"));
        assert!(output.base_ref.is_none());
        assert!(!worker.shares_work_tree());
        assert!(logs.join("fix-lint-001-iter-1-prompt.log").exists());
        assert!(logs.join("fix-lint-001-iter-1-output.log").exists());
    }

    #[tokio::test]
    async fn test_command_worker_tracks_git_changes() {
        let dir = tempdir().unwrap();
        git2::Repository::init(dir.path()).unwrap();
        std::fs::write(dir.path().join("lib.rs"), "use std::fs;\n").unwrap();
        let logs = dir.path().join(".ratchet/logs");

        let worker = CommandWorker::new("cat > /dev/null; echo '' > lib.rs", dir.path(), &logs);
        let output = worker.run(&input()).await.unwrap();

        assert!(output.base_ref.is_some());
        assert_eq!(output.changed_artifacts, vec![PathBuf::from("lib.rs")]);
        assert!(worker.shares_work_tree());
    }
}
