use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "ratchet")]
#[command(version, about = "Checkpointed task runner with bounded retries and human escalation")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Log output format on stderr: pretty or json
    #[arg(long, global = true, default_value = "pretty")]
    pub log_format: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the .ratchet directory, queue database and default config
    Init,
    /// Add tasks to the queue, from flags or a TOML/JSON task file
    Enqueue(EnqueueArgs),
    /// Drive ready tasks through their iterations
    Run {
        /// Keep polling for new work after the queue drains
        #[arg(long)]
        watch: bool,
        /// Resolve escalations automatically (APPROVE by system)
        #[arg(long)]
        headless: bool,
        /// Maximum tasks in progress at once
        #[arg(long)]
        max_concurrent: Option<usize>,
        /// No progress bars
        #[arg(short, long)]
        quiet: bool,
    },
    /// Show status, iteration count, last verdict and next steps of a task
    Status {
        task_id: String,
        #[arg(long)]
        json: bool,
    },
    /// List tasks in the queue
    List {
        /// Only tasks with this status
        #[arg(long)]
        status: Option<String>,
        /// List archived tasks instead
        #[arg(long)]
        archived: bool,
        #[arg(long)]
        json: bool,
    },
    /// List decision requests waiting on a human
    Requests {
        #[arg(long)]
        json: bool,
    },
    /// Resolve a decision request (by request id or task id)
    Resolve(ResolveArgs),
    /// Move a finished task and its history out of the active queue
    Archive { task_id: String },
    Audit {
        #[command(subcommand)]
        command: AuditCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(clap::Args, Clone, Debug)]
pub struct EnqueueArgs {
    /// Task id
    #[arg(required_unless_present = "file")]
    pub id: Option<String>,
    /// What the worker should accomplish
    #[arg(short, long, required_unless_present = "file")]
    pub description: Option<String>,
    /// Iteration budget (defaults to [defaults] iteration_budget)
    #[arg(short, long)]
    pub budget: Option<i64>,
    /// Completion sentinel (defaults to [defaults] completion_sentinel)
    #[arg(short, long)]
    pub sentinel: Option<String>,
    #[arg(short, long)]
    pub priority: Option<i64>,
    /// Task ids this task depends on (repeatable or comma-separated)
    #[arg(long = "depends-on", value_delimiter = ',')]
    pub depends_on: Vec<String>,
    /// Read tasks from a .toml or .json file instead
    #[arg(short, long, conflicts_with_all = ["id", "description"])]
    pub file: Option<PathBuf>,
}

#[derive(clap::Args, Clone, Debug)]
#[command(group(ArgGroup::new("decision").required(true).args(["approve", "override_", "abort", "interactive"])))]
pub struct ResolveArgs {
    /// Request id, or the id of the blocked task
    pub target: String,
    /// Accept the escalation: revert the last change set and fail the task
    #[arg(long)]
    pub approve: bool,
    /// Waive the trigger and resume the task at its current iteration
    #[arg(long = "override")]
    pub override_: bool,
    /// Fail the task permanently
    #[arg(long)]
    pub abort: bool,
    /// Show the request and choose interactively
    #[arg(short, long)]
    pub interactive: bool,
    #[arg(short, long)]
    pub note: Option<String>,
}

#[derive(Subcommand)]
pub enum AuditCommands {
    /// Write a JSON timeline of every task for replay
    Export { output: PathBuf },
    /// Print the timeline of one task
    Show { task_id: String },
    /// List recorded driver runs
    Runs,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default ratchet.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let log_format = cli
        .log_format
        .parse::<ratchet::logging::LogFormat>()
        .map_err(|e| anyhow::anyhow!(e))?;
    let log_dir = project_dir.join(".ratchet").join("logs");
    let _log_guard = ratchet::logging::init(cli.verbose, log_format, Some(&log_dir));

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir).await?,
        Commands::Enqueue(args) => cmd::cmd_enqueue(&project_dir, args).await?,
        Commands::Run {
            watch,
            headless,
            max_concurrent,
            quiet,
        } => {
            cmd::cmd_run(&cli, &project_dir, *watch, *headless, *max_concurrent, *quiet).await?
        }
        Commands::Status { task_id, json } => cmd::cmd_status(&project_dir, task_id, *json).await?,
        Commands::List {
            status,
            archived,
            json,
        } => cmd::cmd_list(&project_dir, status.as_deref(), *archived, *json).await?,
        Commands::Requests { json } => cmd::cmd_requests(&project_dir, *json).await?,
        Commands::Resolve(args) => cmd::cmd_resolve(&project_dir, args).await?,
        Commands::Archive { task_id } => cmd::cmd_archive(&project_dir, task_id).await?,
        Commands::Audit { command } => cmd::cmd_audit(&project_dir, command).await?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
