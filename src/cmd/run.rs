//! Queue driving: `ratchet run`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ratchet::audit::{AuditLogger, RunConfig, RunEvent};
use ratchet::config::Config;
use ratchet::driver::{Driver, DriverEvent};
use ratchet::ui::RunUI;

use super::Project;
use crate::Cli;

const EVENT_BUFFER: usize = 256;

pub async fn cmd_run(
    cli: &Cli,
    project_dir: &Path,
    watch: bool,
    headless: bool,
    max_concurrent: Option<usize>,
    quiet: bool,
) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), cli.verbose, headless, max_concurrent)?;
    for warning in config.settings().validate() {
        warn!("{}", warning);
    }
    let project = Project::open_with(config)?;
    let config = &project.config;
    let toml = config.toml();

    let controller = config.controller(&project.queue)?;
    let (tx, mut rx) = mpsc::channel::<DriverEvent>(EVENT_BUFFER);
    let driver = Driver::new(
        project.queue.clone(),
        controller,
        toml.rate_limiter(),
        toml.driver_settings(watch),
    )
    .with_event_channel(tx);

    let mut audit = AuditLogger::new(&config.audit_dir);
    audit.start_run(RunConfig {
        owner: driver.owner().to_string(),
        escalation_mode: config.settings().escalation_mode().to_string(),
        max_concurrent: toml.queue.max_concurrent,
        worker_command: toml.worker.command.clone(),
        verifier_command: toml.verifier.command.clone().unwrap_or_default(),
        project_dir: config.project_dir.clone(),
    })?;

    let counts = project.queue.counts().await?;
    let ui = if quiet {
        RunUI::hidden()
    } else {
        RunUI::new(counts.active() as u64, cli.verbose)
    };
    info!(
        owner = driver.owner(),
        mode = %config.settings().escalation_mode(),
        pending = counts.pending,
        in_progress = counts.in_progress,
        "starting driver"
    );

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted, stopping after the current iterations...");
            ctrl_c.cancel();
        }
    });

    let run = tokio::spawn({
        let cancel = cancel.clone();
        async move { driver.run(cancel).await }
    });

    // The driver holds the only sender; the channel closes when it returns.
    while let Some(event) = rx.recv().await {
        ui.handle(&event);
        if let Err(e) = audit.record(RunEvent::from_driver_event(&event)) {
            warn!(error = %e, "failed to record run event");
        }
    }

    let summary = run
        .await
        .context("Driver task panicked")?
        .context("Driver stopped on a queue error")?;
    ui.finish(&summary);
    let run_file = audit.finish_run(summary.clone())?;
    info!(run_log = %run_file.display(), "run recorded");

    if summary.escalated.len() > summary.auto_resolved.len() {
        println!(
            "{}",
            style("Some tasks are waiting on a decision: see `ratchet requests`").yellow()
        );
    }
    Ok(())
}
