//! Project initialization: `ratchet init`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;

use ratchet::config::Config;
use ratchet::db::Database;
use ratchet::ratchet_config::RatchetToml;

pub async fn cmd_init(project_dir: &Path) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), false, false, None)?;
    let was_initialized = config.is_initialized();

    config.ensure_directories()?;
    Database::open(&config.db_file)
        .with_context(|| format!("Failed to create {}", config.db_file.display()))?;

    let config_file = config.config_file();
    let wrote_config = if config_file.exists() {
        false
    } else {
        RatchetToml::default().save(&config_file)?;
        true
    };

    if was_initialized {
        println!(
            "Ratchet project already initialized at {}",
            config.ratchet_dir.display()
        );
        println!("Directory structure verified.");
        return Ok(());
    }

    println!(
        "{} ratchet project at {}",
        style("Initialized").green().bold(),
        config.ratchet_dir.display()
    );
    println!();
    println!("  .ratchet/");
    println!("  ├── queue.db       # tasks, checkpoints, decisions");
    println!("  ├── ratchet.toml   # configuration{}", if wrote_config { "" } else { " (kept)" });
    println!("  ├── sessions/      # per-task session records");
    println!("  ├── logs/          # worker prompts/outputs and ratchet logs");
    println!("  └── audit/         # driver run logs");
    println!();
    println!("Next steps:");
    println!("  1. Set [verifier] command in ratchet.toml");
    println!("  2. Run `ratchet enqueue <id> -d \"...\"` to add a task");
    println!("  3. Run `ratchet run` to start working through the queue");
    Ok(())
}
