use anyhow::{Context, Result, anyhow};
use std::path::PathBuf;
use std::sync::Arc;

use crate::controller::IterationController;
use crate::db::{Database, DbHandle};
use crate::escalation::Escalation;
use crate::queue::WorkQueue;
use crate::ratchet_config::{ENV_VERIFY_CMD, RatchetConfig, RatchetToml};
use crate::session::FileSessionStore;
use crate::tracker::GitReverter;
use crate::verify::CommandVerifier;
use crate::worker::CommandWorker;

/// Runtime layout of a project's `.ratchet` directory, plus the wiring that
/// turns a [`RatchetConfig`] into a running engine.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub ratchet_dir: PathBuf,
    pub db_file: PathBuf,
    pub sessions_dir: PathBuf,
    pub log_dir: PathBuf,
    pub audit_dir: PathBuf,
    pub verbose: bool,
    settings: RatchetConfig,
}

impl Config {
    pub fn new(
        project_dir: PathBuf,
        verbose: bool,
        headless: bool,
        max_concurrent: Option<usize>,
    ) -> Result<Self> {
        let settings =
            RatchetConfig::with_cli_args(project_dir, verbose, headless, max_concurrent)?;
        Ok(Self::from_settings(settings))
    }

    pub fn from_settings(settings: RatchetConfig) -> Self {
        let ratchet_dir = settings.ratchet_dir.clone();
        Self {
            project_dir: settings.project_dir.clone(),
            db_file: ratchet_dir.join("queue.db"),
            sessions_dir: ratchet_dir.join("sessions"),
            log_dir: ratchet_dir.join("logs"),
            audit_dir: ratchet_dir.join("audit"),
            verbose: settings.verbose,
            ratchet_dir,
            settings,
        }
    }

    pub fn settings(&self) -> &RatchetConfig {
        &self.settings
    }

    pub fn toml(&self) -> &RatchetToml {
        &self.settings.toml
    }

    pub fn config_file(&self) -> PathBuf {
        self.settings.config_file()
    }

    pub fn is_initialized(&self) -> bool {
        self.db_file.exists()
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.ratchet_dir).context("Failed to create .ratchet directory")?;
        std::fs::create_dir_all(self.sessions_dir.join("active"))
            .context("Failed to create sessions directory")?;
        std::fs::create_dir_all(self.sessions_dir.join("archive"))
            .context("Failed to create session archive directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        std::fs::create_dir_all(&self.audit_dir).context("Failed to create audit directory")?;
        Ok(())
    }

    /// Open the queue database. Fails if `ratchet init` has not run.
    pub fn open_queue(&self) -> Result<WorkQueue> {
        if !self.is_initialized() {
            return Err(anyhow!(
                "No ratchet project in {}. Run `ratchet init` first",
                self.project_dir.display()
            ));
        }
        let db = Database::open(&self.db_file)
            .with_context(|| format!("Failed to open {}", self.db_file.display()))?;
        Ok(WorkQueue::new(DbHandle::new(db), self.toml().lease()))
    }

    pub fn session_store(&self) -> Arc<FileSessionStore> {
        let section = &self.toml().session;
        Arc::new(FileSessionStore::new(
            &self.sessions_dir,
            section.segment_threshold,
            section.summary_chars,
        ))
    }

    pub fn escalation(&self, queue: &WorkQueue) -> Escalation {
        Escalation::new(
            queue.clone(),
            self.session_store(),
            Arc::new(GitReverter::new(&self.project_dir)),
            self.settings.escalation_mode(),
        )
    }

    /// Assemble the iteration controller from the configured worker and
    /// verifier commands.
    pub fn controller(&self, queue: &WorkQueue) -> Result<IterationController> {
        let toml = self.toml();
        let verify_cmd = toml
            .verifier
            .command
            .clone()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| {
                anyhow!(
                    "No verifier configured. Set [verifier] command in {} or {}",
                    self.config_file().display(),
                    ENV_VERIFY_CMD
                )
            })?;
        let worker = CommandWorker::new(toml.worker.command.clone(), &self.project_dir, &self.log_dir);
        let verifier = CommandVerifier::new(
            verify_cmd,
            &self.project_dir,
            std::time::Duration::from_secs(toml.verifier.timeout_secs),
        );
        Ok(IterationController::new(
            queue.clone(),
            self.session_store(),
            self.escalation(queue),
            Arc::new(worker),
            Arc::new(verifier),
            toml.controller_settings(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config_in(dir: &std::path::Path) -> Config {
        Config::new(dir.to_path_buf(), false, false, None).unwrap()
    }

    #[test]
    fn test_paths_in_ratchet_directory() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        let root = dir.path().canonicalize().unwrap().join(".ratchet");
        assert_eq!(config.db_file, root.join("queue.db"));
        assert_eq!(config.sessions_dir, root.join("sessions"));
        assert_eq!(config.log_dir, root.join("logs"));
        assert_eq!(config.config_file(), root.join("ratchet.toml"));
    }

    #[test]
    fn test_ensure_directories() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        config.ensure_directories().unwrap();
        assert!(config.sessions_dir.join("active").exists());
        assert!(config.sessions_dir.join("archive").exists());
        assert!(config.log_dir.exists());
        assert!(config.audit_dir.exists());
    }

    #[test]
    fn test_open_queue_requires_init() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        let err = config.open_queue().unwrap_err();
        assert!(err.to_string().contains("ratchet init"));
    }

    #[tokio::test]
    async fn test_open_queue_after_init() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        config.ensure_directories().unwrap();
        Database::open(&config.db_file).unwrap();

        let queue = config.open_queue().unwrap();
        assert!(queue.list(None).await.unwrap().is_empty());
    }

    #[test]
    fn test_controller_requires_verifier() {
        let dir = tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.ensure_directories().unwrap();
        Database::open(&config.db_file).unwrap();
        let queue = config.open_queue().unwrap();

        config.settings.toml.verifier.command = None;
        let err = config.controller(&queue).err().unwrap();
        assert!(err.to_string().contains("No verifier configured"));

        config.settings.toml.verifier.command = Some("true".into());
        assert!(config.controller(&queue).is_ok());
    }
}
