//! Audit commands: `ratchet audit export|show|runs`.

use anyhow::{Result, anyhow};
use console::style;
use std::path::Path;

use ratchet::audit::{AuditExport, AuditLogger, timeline};

use super::Project;
use crate::AuditCommands;

pub async fn cmd_audit(project_dir: &Path, command: &AuditCommands) -> Result<()> {
    let project = Project::open(project_dir)?;

    match command {
        AuditCommands::Export { output } => {
            let export = AuditExport::collect(
                &project.config.project_dir,
                &project.queue,
                &project.escalation,
                &project.sessions,
            )
            .await?;
            export.save(output)?;
            let checkpoints: usize = export.tasks.iter().map(|t| t.checkpoints.len()).sum();
            let decisions: usize = export.tasks.iter().map(|t| t.decisions.len()).sum();
            println!(
                "Exported {} task(s), {} checkpoint(s), {} decision(s) to {}",
                export.tasks.len(),
                checkpoints,
                decisions,
                output.display()
            );
        }
        AuditCommands::Show { task_id } => {
            let (task, archived) = match project.queue.get(task_id).await? {
                Some(task) => (task, false),
                None => project
                    .queue
                    .list_archived()
                    .await?
                    .into_iter()
                    .find(|t| &t.id == task_id)
                    .map(|t| (t, true))
                    .ok_or_else(|| anyhow!("Task '{}' not found", task_id))?,
            };
            let timeline =
                timeline(task, archived, &project.queue, &project.escalation, &project.sessions)
                    .await?;

            println!();
            println!(
                "Timeline for {} ({})",
                style(&timeline.task.id).bold(),
                timeline.task.status
            );
            println!();
            for entry in timeline.entries() {
                println!(
                    "  {}  {:<14} {}",
                    style(entry.at.format("%Y-%m-%d %H:%M:%S")).dim(),
                    style(&entry.label).cyan(),
                    entry.detail
                );
            }
            if let Some(session) = &timeline.session
                && !session.narrative.is_empty()
            {
                println!();
                println!("{}", style("Session narrative:").underlined());
                for line in session.narrative.lines() {
                    println!("  {}", line);
                }
            }
            println!();
        }
        AuditCommands::Runs => {
            let logger = AuditLogger::new(&project.config.audit_dir);
            let runs = logger.list_runs()?;
            if runs.is_empty() {
                println!("No recorded runs.");
                return Ok(());
            }
            for path in runs {
                let run = logger.load_run(&path)?;
                let summary = run.summary.unwrap_or_default();
                println!(
                    "  {}  {}  {} completed, {} escalated, {} iterations",
                    style(run.started_at.format("%Y-%m-%d %H:%M:%S")).dim(),
                    &run.run_id.to_string()[..8],
                    summary.completed.len(),
                    summary.escalated.len(),
                    summary.iterations
                );
            }
        }
    }

    Ok(())
}
