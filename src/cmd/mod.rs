//! CLI command implementations.
//!
//! | Module     | Commands handled                          |
//! |------------|-------------------------------------------|
//! | `project`  | `Init`                                    |
//! | `tasks`    | `Enqueue`, `Status`, `List`, `Archive`    |
//! | `run`      | `Run`                                     |
//! | `resolve`  | `Requests`, `Resolve`                     |
//! | `audit`    | `Audit`                                   |
//! | `config`   | `Config`                                  |

pub mod audit;
pub mod config;
pub mod project;
pub mod resolve;
pub mod run;
pub mod tasks;

pub use audit::cmd_audit;
pub use config::cmd_config;
pub use project::cmd_init;
pub use resolve::{cmd_requests, cmd_resolve};
pub use run::cmd_run;
pub use tasks::{cmd_archive, cmd_enqueue, cmd_list, cmd_status};

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use ratchet::config::Config;
use ratchet::escalation::Escalation;
use ratchet::queue::WorkQueue;
use ratchet::session::FileSessionStore;

/// Handles every read/resolve command needs.
pub struct Project {
    pub config: Config,
    pub queue: WorkQueue,
    pub sessions: Arc<FileSessionStore>,
    pub escalation: Escalation,
}

impl Project {
    pub fn open(project_dir: &Path) -> Result<Self> {
        Self::open_with(Config::new(project_dir.to_path_buf(), false, false, None)?)
    }

    pub fn open_with(config: Config) -> Result<Self> {
        let queue = config.open_queue()?;
        let sessions = config.session_store();
        let escalation = config.escalation(&queue);
        Ok(Self {
            config,
            queue,
            sessions,
            escalation,
        })
    }
}
