use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::driver::{DriverEvent, DriverSummary};

/// Settings a driver run was started with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub owner: String,
    pub escalation_mode: String,
    pub max_concurrent: usize,
    pub worker_command: String,
    pub verifier_command: String,
    pub project_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub at: DateTime<Utc>,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub detail: String,
}

impl RunEvent {
    pub fn from_driver_event(event: &DriverEvent) -> Self {
        let (kind, task_id, detail) = match event {
            DriverEvent::Claimed {
                task_id,
                resumed,
                iteration,
                budget,
            } => (
                "claimed",
                Some(task_id.clone()),
                format!(
                    "{} at iteration {}/{}",
                    if *resumed { "resumed" } else { "started" },
                    iteration,
                    budget
                ),
            ),
            DriverEvent::IterationFinished {
                task_id,
                iteration,
                transition,
                verdict,
            } => {
                let mut detail = format!("iteration {} {}", iteration, transition);
                if let Some(v) = verdict {
                    detail.push_str(&format!(" ({} \"{}\")", v.kind.as_str(), v.reason));
                }
                ("iteration", Some(task_id.clone()), detail)
            }
            DriverEvent::Completed {
                task_id,
                iterations,
            } => (
                "completed",
                Some(task_id.clone()),
                format!("after {} iterations", iterations),
            ),
            DriverEvent::Escalated {
                task_id,
                request_id,
                reason,
                auto_resolved,
            } => (
                "escalated",
                Some(task_id.clone()),
                format!(
                    "request #{}: {}{}",
                    request_id,
                    reason,
                    if *auto_resolved { " (auto-resolved)" } else { "" }
                ),
            ),
            DriverEvent::Released { task_id } => {
                ("released", Some(task_id.clone()), "cancelled".to_string())
            }
            DriverEvent::Errored { task_id, message } => {
                ("errored", Some(task_id.clone()), message.clone())
            }
            DriverEvent::LeasesReaped { task_ids } => {
                ("leases_reaped", None, task_ids.join(", "))
            }
        };
        Self {
            at: Utc::now(),
            kind: kind.to_string(),
            task_id,
            detail,
        }
    }
}

/// Record of one `ratchet run`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLog {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub config: RunConfig,
    pub events: Vec<RunEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<DriverSummary>,
}

impl RunLog {
    pub fn new(config: RunConfig) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            ended_at: None,
            config,
            events: Vec::new(),
            summary: None,
        }
    }
}

/// Writes the in-flight run to `current-run.json` as events arrive and moves
/// it under `runs/` when the run finishes.
pub struct AuditLogger {
    audit_dir: PathBuf,
    current_run: Option<RunLog>,
    current_run_file: PathBuf,
}

impl AuditLogger {
    pub fn new(audit_dir: &Path) -> Self {
        let current_run_file = audit_dir.join("current-run.json");
        Self {
            audit_dir: audit_dir.to_path_buf(),
            current_run: None,
            current_run_file,
        }
    }

    pub fn start_run(&mut self, config: RunConfig) -> Result<()> {
        self.current_run = Some(RunLog::new(config));
        self.save_current()
    }

    /// Append an event to the current run.
    pub fn record(&mut self, event: RunEvent) -> Result<()> {
        let run = self
            .current_run
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("record called with no active run"))?;
        run.events.push(event);
        self.save_current()
    }

    pub fn finish_run(&mut self, summary: DriverSummary) -> Result<PathBuf> {
        let run = self
            .current_run
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("No current run to finish"))?;

        run.ended_at = Some(Utc::now());
        run.summary = Some(summary);

        let filename = format!(
            "{}_{}.json",
            run.started_at.format("%Y-%m-%dT%H-%M-%S"),
            &run.run_id.to_string()[..8]
        );
        let runs_dir = self.audit_dir.join("runs");
        fs::create_dir_all(&runs_dir).context("Failed to create runs directory")?;
        let run_file = runs_dir.join(&filename);

        let json = serde_json::to_string_pretty(&run).context("Failed to serialize run log")?;
        fs::write(&run_file, json).context("Failed to write run log")?;

        if self.current_run_file.exists() {
            fs::remove_file(&self.current_run_file)
                .context("Failed to remove current-run.json after finishing run")?;
        }

        self.current_run = None;
        Ok(run_file)
    }

    fn save_current(&self) -> Result<()> {
        if let Some(ref run) = self.current_run {
            let json =
                serde_json::to_string_pretty(&run).context("Failed to serialize current run")?;
            fs::write(&self.current_run_file, json).context("Failed to write current run file")?;
        }
        Ok(())
    }

    pub fn current_run(&self) -> Option<&RunLog> {
        self.current_run.as_ref()
    }

    /// Finished run logs, most recent first.
    pub fn list_runs(&self) -> Result<Vec<PathBuf>> {
        let runs_dir = self.audit_dir.join("runs");
        if !runs_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs: Vec<PathBuf> = fs::read_dir(&runs_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect();

        runs.sort();
        runs.reverse();
        Ok(runs)
    }

    pub fn load_run(&self, path: &Path) -> Result<RunLog> {
        let content = fs::read_to_string(path).context("Failed to read run log")?;
        serde_json::from_str(&content).context("Failed to parse run log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratchet_common::{Transition, Verdict};
    use tempfile::TempDir;

    fn config() -> RunConfig {
        RunConfig {
            owner: "driver-test".into(),
            escalation_mode: "interactive".into(),
            max_concurrent: 2,
            worker_command: "agent".into(),
            verifier_command: "verify".into(),
            project_dir: PathBuf::from("."),
        }
    }

    #[test]
    fn test_record_requires_active_run() {
        let dir = TempDir::new().unwrap();
        let mut logger = AuditLogger::new(dir.path());
        let event = RunEvent::from_driver_event(&DriverEvent::Released {
            task_id: "a".into(),
        });
        assert!(logger.record(event).is_err());
    }

    #[test]
    fn test_full_run_lifecycle() {
        let dir = TempDir::new().unwrap();
        let mut logger = AuditLogger::new(dir.path());
        logger.start_run(config()).unwrap();
        assert!(dir.path().join("current-run.json").exists());

        logger
            .record(RunEvent::from_driver_event(&DriverEvent::IterationFinished {
                task_id: "fix-lint-001".into(),
                iteration: 1,
                transition: Transition::Retry,
                verdict: Some(Verdict::fail("lint errors remain")),
            }))
            .unwrap();
        logger
            .record(RunEvent::from_driver_event(&DriverEvent::Completed {
                task_id: "fix-lint-001".into(),
                iterations: 2,
            }))
            .unwrap();

        let summary = DriverSummary {
            completed: vec!["fix-lint-001".into()],
            iterations: 2,
            ..Default::default()
        };
        let path = logger.finish_run(summary.clone()).unwrap();
        assert!(!dir.path().join("current-run.json").exists());
        assert!(logger.current_run().is_none());

        let runs = logger.list_runs().unwrap();
        assert_eq!(runs, vec![path.clone()]);

        let run = logger.load_run(&path).unwrap();
        assert_eq!(run.events.len(), 2);
        assert_eq!(run.events[0].kind, "iteration");
        assert!(run.events[0].detail.contains("lint errors remain"));
        assert_eq!(run.summary, Some(summary));
        assert!(run.ended_at.is_some());
    }

    #[test]
    fn test_list_runs_empty_without_directory() {
        let dir = TempDir::new().unwrap();
        let logger = AuditLogger::new(dir.path());
        assert!(logger.list_runs().unwrap().is_empty());
    }
}
