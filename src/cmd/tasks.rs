//! Queue commands: `ratchet enqueue`, `status`, `list` and `archive`.

use anyhow::{Context, Result, anyhow};
use console::style;
use serde::Deserialize;
use std::path::Path;

use ratchet::errors::SessionError;
use ratchet::ratchet_config::DefaultsConfig;
use ratchet::status::task_status;
use ratchet_common::{NewTask, Task, TaskStatus};

use super::Project;
use crate::EnqueueArgs;

/// One task as written in a task file. Missing fields take the
/// `[defaults]` values.
#[derive(Debug, Clone, Deserialize)]
struct TaskSpec {
    id: String,
    description: String,
    #[serde(default)]
    priority: Option<i64>,
    #[serde(default, alias = "depends_on")]
    dependencies: Vec<String>,
    #[serde(default, alias = "budget")]
    iteration_budget: Option<i64>,
    #[serde(default, alias = "sentinel")]
    completion_sentinel: Option<String>,
}

impl TaskSpec {
    fn into_new_task(self, defaults: &DefaultsConfig) -> NewTask {
        NewTask::new(
            self.id,
            self.description,
            self.iteration_budget
                .unwrap_or(i64::from(defaults.iteration_budget)),
            self.completion_sentinel
                .unwrap_or_else(|| defaults.completion_sentinel.clone()),
        )
        .with_priority(self.priority.unwrap_or(defaults.priority))
        .with_dependencies(self.dependencies)
    }
}

/// Accepted task file shapes: a list, a single task, or `[[task]]` tables.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TaskInput {
    Many(Vec<TaskSpec>),
    One(TaskSpec),
    File {
        #[serde(rename = "task", alias = "tasks")]
        tasks: Vec<TaskSpec>,
    },
}

impl TaskInput {
    fn into_specs(self) -> Vec<TaskSpec> {
        match self {
            TaskInput::Many(specs) | TaskInput::File { tasks: specs } => specs,
            TaskInput::One(spec) => vec![spec],
        }
    }
}

fn parse_task_file(path: &Path) -> Result<Vec<TaskSpec>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read task file: {}", path.display()))?;
    let input: TaskInput = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {} as JSON", path.display()))?,
        Some("toml") => toml::from_str(&content)
            .with_context(|| format!("Failed to parse {} as TOML", path.display()))?,
        _ => return Err(anyhow!("Task file must end in .toml or .json: {}", path.display())),
    };
    Ok(input.into_specs())
}

fn task_from_args(args: &EnqueueArgs, defaults: &DefaultsConfig) -> Result<NewTask> {
    let id = args.id.clone().ok_or_else(|| anyhow!("A task id is required"))?;
    let description = args
        .description
        .clone()
        .ok_or_else(|| anyhow!("--description is required"))?;
    let spec = TaskSpec {
        id,
        description,
        priority: args.priority,
        dependencies: args.depends_on.clone(),
        iteration_budget: args.budget,
        completion_sentinel: args.sentinel.clone(),
    };
    Ok(spec.into_new_task(defaults))
}

pub async fn cmd_enqueue(project_dir: &Path, args: &EnqueueArgs) -> Result<()> {
    let project = Project::open(project_dir)?;
    let defaults = &project.config.toml().defaults;

    let tasks: Vec<NewTask> = match &args.file {
        Some(path) => parse_task_file(path)?
            .into_iter()
            .map(|spec| spec.into_new_task(defaults))
            .collect(),
        None => vec![task_from_args(args, defaults)?],
    };
    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    for new in tasks {
        let id = new.id.clone();
        let task = project
            .queue
            .enqueue(new)
            .await
            .with_context(|| format!("Failed to enqueue '{}'", id))?;
        println!(
            "{} {} (budget {}, priority {}{})",
            style("Enqueued").green(),
            style(&task.id).bold(),
            task.iteration_budget,
            task.priority,
            if task.dependencies.is_empty() {
                String::new()
            } else {
                format!(", after {}", task.dependencies.join(", "))
            }
        );
    }
    Ok(())
}

fn styled_status(status: TaskStatus) -> String {
    let s = status.as_str();
    match status {
        TaskStatus::Pending => style(s).dim().to_string(),
        TaskStatus::InProgress => style(s).cyan().to_string(),
        TaskStatus::Blocked => style(s).yellow().bold().to_string(),
        TaskStatus::Completed => style(s).green().to_string(),
        TaskStatus::Failed => style(s).red().to_string(),
    }
}

pub async fn cmd_status(project_dir: &Path, task_id: &str, json: bool) -> Result<()> {
    let project = Project::open(project_dir)?;
    let report = task_status(&project.queue, &project.sessions, &project.escalation, task_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    println!("Task {}{}", style(&report.task_id).bold(), if report.archived { " (archived)" } else { "" });
    println!("  Status:     {}", styled_status(report.status));
    if let Some(reason) = &report.status_reason {
        println!("  Reason:     {}", reason);
    }
    println!(
        "  Iterations: {}/{}",
        report.iteration_count, report.iteration_budget
    );
    match &report.last_verdict {
        Some(v) => println!("  Verdict:    {} {}", v.kind.as_str(), style(&v.reason).dim()),
        None => println!("  Verdict:    {}", style("none yet").dim()),
    }
    if let Some(owner) = &report.owner {
        println!("  Owner:      {}", owner);
    }
    if !report.next_steps.is_empty() {
        println!("  Next steps:");
        for step in &report.next_steps {
            println!("    - {}", step);
        }
    }
    if let Some(request) = &report.open_request {
        println!();
        println!(
            "  {} request #{}: {}",
            style("Waiting on a decision,").yellow(),
            request.id,
            request.reason
        );
        println!(
            "  Resolve with `ratchet resolve {} --approve|--override|--abort`",
            request.id
        );
    }
    println!();
    Ok(())
}

fn print_task_row(task: &Task) {
    println!(
        "  {:<24} {:<22} {:>5}  {:>4}  {}",
        task.id,
        styled_status(task.status),
        format!("{}/{}", task.retry_count, task.iteration_budget),
        task.priority,
        task.status_reason
            .as_deref()
            .map(|r| style(r).dim().to_string())
            .unwrap_or_default()
    );
}

pub async fn cmd_list(
    project_dir: &Path,
    status: Option<&str>,
    archived: bool,
    json: bool,
) -> Result<()> {
    let project = Project::open(project_dir)?;
    let filter = status
        .map(|s| s.parse::<TaskStatus>().map_err(|e| anyhow!(e)))
        .transpose()?;

    let mut tasks = if archived {
        project.queue.list_archived().await?
    } else {
        project.queue.list(filter).await?
    };
    if archived && let Some(status) = filter {
        tasks.retain(|t| t.status == status);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }
    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }

    println!(
        "  {:<24} {:<11} {:>5}  {:>4}  {}",
        style("ID").bold(),
        style("STATUS").bold(),
        style("ITER").bold(),
        style("PRIO").bold(),
        style("REASON").bold()
    );
    for task in &tasks {
        print_task_row(task);
    }

    if !archived {
        let counts = project.queue.counts().await?;
        println!();
        println!(
            "  {} pending, {} in progress, {} blocked, {} completed, {} failed, {} archived",
            counts.pending,
            counts.in_progress,
            counts.blocked,
            counts.completed,
            counts.failed,
            counts.archived
        );
    }
    Ok(())
}

pub async fn cmd_archive(project_dir: &Path, task_id: &str) -> Result<()> {
    let project = Project::open(project_dir)?;
    let task = project
        .queue
        .archive(task_id)
        .await
        .with_context(|| format!("Failed to archive '{}'", task_id))?;

    match project.sessions.archive_sync(task_id) {
        Ok(()) | Err(SessionError::NotFound { .. }) => {}
        Err(e) => return Err(e).context("Failed to archive session"),
    }

    println!(
        "{} {} ({})",
        style("Archived").green(),
        style(&task.id).bold(),
        task.status
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn defaults() -> DefaultsConfig {
        DefaultsConfig::default()
    }

    #[test]
    fn test_parse_toml_task_tables() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.toml");
        std::fs::write(
            &path,
            r#"
[[task]]
id = "a"
description = "first"
budget = 3

[[task]]
id = "b"
description = "second"
depends_on = ["a"]
sentinel = "SHIPPED"
"#,
        )
        .unwrap();

        let tasks: Vec<NewTask> = parse_task_file(&path)
            .unwrap()
            .into_iter()
            .map(|s| s.into_new_task(&defaults()))
            .collect();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].iteration_budget, 3);
        assert_eq!(tasks[0].completion_sentinel, "TASK COMPLETE");
        assert_eq!(tasks[1].dependencies, vec!["a".to_string()]);
        assert_eq!(tasks[1].completion_sentinel, "SHIPPED");
        assert_eq!(tasks[1].iteration_budget, 5);
    }

    #[test]
    fn test_parse_json_list_and_single() {
        let dir = tempdir().unwrap();
        let list = dir.path().join("list.json");
        std::fs::write(
            &list,
            r#"[{"id": "a", "description": "x", "priority": 7}, {"id": "b", "description": "y"}]"#,
        )
        .unwrap();
        let specs = parse_task_file(&list).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].priority, Some(7));

        let single = dir.path().join("one.json");
        std::fs::write(&single, r#"{"id": "solo", "description": "z"}"#).unwrap();
        let specs = parse_task_file(&single).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].id, "solo");
    }

    #[test]
    fn test_parse_rejects_unknown_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.yaml");
        std::fs::write(&path, "id: a").unwrap();
        assert!(parse_task_file(&path).is_err());
    }
}
