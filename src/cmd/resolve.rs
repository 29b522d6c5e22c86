//! Human escalation commands: `ratchet requests` and `ratchet resolve`.

use anyhow::{Context, Result, anyhow};
use console::style;
use dialoguer::{Input, Select, theme::ColorfulTheme};
use std::path::Path;

use ratchet_common::{Actor, DecisionKind, DecisionRequest};

use super::Project;
use crate::ResolveArgs;

fn print_request(request: &DecisionRequest) {
    println!(
        "  #{:<4} {:<24} {} {}",
        request.id,
        style(&request.task_id).bold(),
        style(&request.reason).yellow(),
        style(format!("(iteration {}, {})", request.iteration, request.created_at.format("%Y-%m-%d %H:%M"))).dim()
    );
    for line in &request.evidence {
        println!("         {}", style(line).dim());
    }
}

pub async fn cmd_requests(project_dir: &Path, json: bool) -> Result<()> {
    let project = Project::open(project_dir)?;
    let pending = project.escalation.pending_requests().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&pending)?);
        return Ok(());
    }
    if pending.is_empty() {
        println!("No pending decision requests.");
        return Ok(());
    }
    println!("{} pending decision request(s):", pending.len());
    for request in &pending {
        print_request(request);
    }
    println!();
    println!("Resolve with `ratchet resolve <id> --approve|--override|--abort`");
    Ok(())
}

/// A numeric target is a request id, anything else a task id.
async fn find_request(project: &Project, target: &str) -> Result<DecisionRequest> {
    if let Ok(id) = target.parse::<i64>()
        && let Some(request) = project.escalation.request(id).await?
    {
        return Ok(request);
    }
    project
        .escalation
        .request_for(target)
        .await?
        .ok_or_else(|| anyhow!("No open decision request for '{}'", target))
}

fn choose_interactively(request: &DecisionRequest) -> Result<(DecisionKind, Option<String>)> {
    println!();
    println!("Task {} is blocked at iteration {}", style(&request.task_id).bold(), request.iteration);
    println!("Reason: {}", style(&request.reason).yellow());
    for line in &request.evidence {
        println!("  {}", style(line).dim());
    }
    println!();

    let options = [
        "Approve  - revert the last change set and fail the task",
        "Override - waive this trigger and resume",
        "Abort    - fail the task, keep the changes",
    ];
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Decision")
        .items(&options)
        .default(0)
        .interact()?;
    let kind = match selection {
        0 => DecisionKind::Approve,
        1 => DecisionKind::Override,
        _ => DecisionKind::Abort,
    };

    let note: String = Input::with_theme(&ColorfulTheme::default())
        .with_prompt("Note (optional)")
        .allow_empty(true)
        .interact_text()?;
    let note = Some(note.trim().to_string()).filter(|n| !n.is_empty());
    Ok((kind, note))
}

pub async fn cmd_resolve(project_dir: &Path, args: &ResolveArgs) -> Result<()> {
    let project = Project::open(project_dir)?;
    let request = find_request(&project, &args.target).await?;
    if !request.is_open() {
        return Err(anyhow!(
            "Request #{} was already resolved ({})",
            request.id,
            request
                .resolution
                .map(|k| k.as_str())
                .unwrap_or("unknown")
        ));
    }

    let (kind, note) = if args.interactive {
        choose_interactively(&request)?
    } else if args.approve {
        (DecisionKind::Approve, args.note.clone())
    } else if args.override_ {
        (DecisionKind::Override, args.note.clone())
    } else {
        (DecisionKind::Abort, args.note.clone())
    };

    let resolution = project
        .escalation
        .resolve(request.id, kind, Actor::Human, note.as_deref())
        .await
        .with_context(|| format!("Failed to resolve request #{}", request.id))?;

    println!(
        "{} request #{} for {}: {}",
        style("Resolved").green(),
        resolution.request.id,
        style(&resolution.task.id).bold(),
        kind
    );
    match kind {
        DecisionKind::Override => {
            println!("Task is back in progress; the next `ratchet run` resumes it.")
        }
        DecisionKind::Approve | DecisionKind::Abort => {
            println!("Task marked {}.", resolution.task.status)
        }
    }
    if let Some(err) = &resolution.revert_error {
        println!(
            "{} could not revert the last change set: {}",
            style("Warning:").yellow().bold(),
            err
        );
    }
    Ok(())
}
