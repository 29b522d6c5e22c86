//! Project configuration read from `.ratchet/ratchet.toml`.
//!
//! Settings are layered file → environment → CLI. Every section is optional
//! and falls back to the defaults shown here:
//!
//! ```toml
//! [defaults]
//! iteration_budget = 5
//! completion_sentinel = "TASK COMPLETE"
//! priority = 0
//!
//! [queue]
//! max_concurrent = 4
//! lease_secs = 900
//!
//! [iteration]
//! timeout_secs = 1800
//! infra_retries = 3
//! infra_backoff_ms = 500
//!
//! [session]
//! segment_threshold = 65536
//! summary_chars = 4000
//!
//! [escalation]
//! mode = "interactive"
//! poll_interval_ms = 2000
//!
//! [driver]
//! max_iterations_per_window = 0
//! window_secs = 3600
//! idle_poll_ms = 1000
//!
//! [worker]
//! command = "claude --print"
//!
//! [verifier]
//! command = "./scripts/verify.sh"
//! timeout_secs = 600
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::controller::ControllerSettings;
use crate::driver::{DriverSettings, IterationRateLimiter};
use crate::escalation::EscalationMode;

pub const CONFIG_FILE: &str = "ratchet.toml";

pub const ENV_WORKER_CMD: &str = "RATCHET_WORKER_CMD";
pub const ENV_VERIFY_CMD: &str = "RATCHET_VERIFY_CMD";
pub const ENV_ESCALATION_MODE: &str = "RATCHET_ESCALATION_MODE";
pub const ENV_MAX_CONCURRENT: &str = "RATCHET_MAX_CONCURRENT";

fn default_iteration_budget() -> u32 {
    5
}

fn default_sentinel() -> String {
    "TASK COMPLETE".to_string()
}

fn default_max_concurrent() -> usize {
    4
}

fn default_lease_secs() -> u64 {
    900
}

fn default_timeout_secs() -> u64 {
    1800
}

fn default_infra_retries() -> u32 {
    3
}

fn default_infra_backoff_ms() -> u64 {
    500
}

fn default_infra_backoff_max_ms() -> u64 {
    30_000
}

fn default_segment_threshold() -> usize {
    64 * 1024
}

fn default_summary_chars() -> usize {
    4000
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_window_secs() -> u64 {
    3600
}

fn default_idle_poll_ms() -> u64 {
    1000
}

fn default_worker_cmd() -> String {
    "claude --print".to_string()
}

fn default_verify_timeout_secs() -> u64 {
    600
}

/// Values applied to `ratchet enqueue` when the submission leaves them out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default = "default_iteration_budget")]
    pub iteration_budget: u32,
    #[serde(default = "default_sentinel")]
    pub completion_sentinel: String,
    #[serde(default)]
    pub priority: i64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            iteration_budget: default_iteration_budget(),
            completion_sentinel: default_sentinel(),
            priority: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSection {
    /// Ceiling on tasks in progress at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// How long a claim survives without a heartbeat.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            lease_secs: default_lease_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationSection {
    /// Wall-clock limit for one worker invocation.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_infra_retries")]
    pub infra_retries: u32,
    #[serde(default = "default_infra_backoff_ms")]
    pub infra_backoff_ms: u64,
    #[serde(default = "default_infra_backoff_max_ms")]
    pub infra_backoff_max_ms: u64,
}

impl Default for IterationSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            infra_retries: default_infra_retries(),
            infra_backoff_ms: default_infra_backoff_ms(),
            infra_backoff_max_ms: default_infra_backoff_max_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSection {
    /// Narrative bytes above which a save seals a segment.
    #[serde(default = "default_segment_threshold")]
    pub segment_threshold: usize,
    /// Narrative characters carried into each worker prompt.
    #[serde(default = "default_summary_chars")]
    pub summary_chars: usize,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            segment_threshold: default_segment_threshold(),
            summary_chars: default_summary_chars(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationSection {
    #[serde(default)]
    pub mode: EscalationMode,
    /// Poll interval for `ratchet resolve --wait`.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for EscalationSection {
    fn default() -> Self {
        Self {
            mode: EscalationMode::default(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverSection {
    /// Iterations allowed per window across all tasks; 0 disables the limit.
    #[serde(default)]
    pub max_iterations_per_window: usize,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
}

impl Default for DriverSection {
    fn default() -> Self {
        Self {
            max_iterations_per_window: 0,
            window_secs: default_window_secs(),
            idle_poll_ms: default_idle_poll_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSection {
    /// Shell command that receives the prompt on stdin.
    #[serde(default = "default_worker_cmd")]
    pub command: String,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            command: default_worker_cmd(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifierSection {
    /// Shell command that judges the working tree. Required for `run`.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_verify_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for VerifierSection {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: default_verify_timeout_secs(),
        }
    }
}

/// The complete ratchet.toml structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RatchetToml {
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub iteration: IterationSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub escalation: EscalationSection,
    #[serde(default)]
    pub driver: DriverSection,
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub verifier: VerifierSection,
}

impl RatchetToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse ratchet.toml")
    }

    /// Load `.ratchet/ratchet.toml`, or the defaults when it doesn't exist.
    pub fn load_or_default(ratchet_dir: &Path) -> Result<Self> {
        let config_path = ratchet_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize ratchet.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(cmd) = lookup(ENV_WORKER_CMD).filter(|v| !v.trim().is_empty()) {
            self.worker.command = cmd;
        }
        if let Some(cmd) = lookup(ENV_VERIFY_CMD).filter(|v| !v.trim().is_empty()) {
            self.verifier.command = Some(cmd);
        }
        if let Some(mode) = lookup(ENV_ESCALATION_MODE) {
            self.escalation.mode = mode
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .with_context(|| format!("{} is invalid", ENV_ESCALATION_MODE))?;
        }
        if let Some(max) = lookup(ENV_MAX_CONCURRENT) {
            self.queue.max_concurrent = max
                .trim()
                .parse()
                .with_context(|| format!("{} must be a number, got '{}'", ENV_MAX_CONCURRENT, max))?;
        }
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.defaults.iteration_budget == 0 {
            warnings.push("defaults.iteration_budget is 0: every task would escalate immediately".into());
        }
        if self.defaults.completion_sentinel.trim().is_empty() {
            warnings.push("defaults.completion_sentinel is empty".into());
        }
        if self.queue.max_concurrent == 0 {
            warnings.push("queue.max_concurrent is 0: treated as 1".into());
        }
        if self.queue.lease_secs < 3 {
            warnings.push(format!(
                "queue.lease_secs = {} is too short for the heartbeat to renew it",
                self.queue.lease_secs
            ));
        }
        if self.iteration.timeout_secs == 0 {
            warnings.push("iteration.timeout_secs is 0: every worker call would time out".into());
        }
        if self.iteration.infra_backoff_max_ms < self.iteration.infra_backoff_ms {
            warnings.push("iteration.infra_backoff_max_ms is below infra_backoff_ms".into());
        }
        if self.session.summary_chars > self.session.segment_threshold / 4 {
            warnings.push(format!(
                "session.summary_chars ({}) exceeds a quarter of segment_threshold; summaries are capped at {}",
                self.session.summary_chars,
                self.session.segment_threshold / 4
            ));
        }
        if self.driver.max_iterations_per_window > 0 && self.driver.window_secs == 0 {
            warnings.push("driver.window_secs is 0 while the iteration limit is enabled".into());
        }
        if self.worker.command.trim().is_empty() {
            warnings.push("worker.command is empty".into());
        }
        match self.verifier.command.as_deref() {
            None => warnings.push(format!(
                "verifier.command is not set (or set {}); `ratchet run` needs it",
                ENV_VERIFY_CMD
            )),
            Some(cmd) if cmd.trim().is_empty() => warnings.push("verifier.command is empty".into()),
            Some(_) => {}
        }

        warnings
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            worker_timeout: Duration::from_secs(self.iteration.timeout_secs),
            infra_retries: self.iteration.infra_retries,
            infra_backoff: Duration::from_millis(self.iteration.infra_backoff_ms),
            infra_backoff_max: Duration::from_millis(self.iteration.infra_backoff_max_ms),
            summary_chars: self.session.summary_chars,
        }
    }

    pub fn driver_settings(&self, watch: bool) -> DriverSettings {
        DriverSettings {
            max_concurrent: self.queue.max_concurrent.max(1),
            idle_poll: Duration::from_millis(self.driver.idle_poll_ms),
            watch,
        }
    }

    pub fn rate_limiter(&self) -> IterationRateLimiter {
        IterationRateLimiter::new(
            self.driver.max_iterations_per_window,
            Duration::from_secs(self.driver.window_secs),
        )
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.queue.lease_secs)
    }
}

/// Unified configuration: ratchet.toml, then environment, then CLI flags.
#[derive(Debug, Clone)]
pub struct RatchetConfig {
    pub project_dir: PathBuf,
    pub ratchet_dir: PathBuf,
    pub toml: RatchetToml,
    pub verbose: bool,
}

impl RatchetConfig {
    /// Load the configuration of the project at `project_dir`.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let ratchet_dir = project_dir.join(".ratchet");
        let mut toml = RatchetToml::load_or_default(&ratchet_dir)?;
        toml.apply_env()?;

        Ok(Self {
            project_dir,
            ratchet_dir,
            toml,
            verbose: false,
        })
    }

    /// Create a RatchetConfig with CLI overrides applied last.
    pub fn with_cli_args(
        project_dir: PathBuf,
        verbose: bool,
        headless: bool,
        max_concurrent: Option<usize>,
    ) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        if headless {
            config.toml.escalation.mode = EscalationMode::Headless;
        }
        if let Some(max) = max_concurrent {
            config.toml.queue.max_concurrent = max;
        }
        Ok(config)
    }

    pub fn config_file(&self) -> PathBuf {
        self.ratchet_dir.join(CONFIG_FILE)
    }

    pub fn escalation_mode(&self) -> EscalationMode {
        self.toml.escalation.mode
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config = RatchetToml::parse("").unwrap();
        assert_eq!(config, RatchetToml::default());
        assert_eq!(config.defaults.iteration_budget, 5);
        assert_eq!(config.defaults.completion_sentinel, "TASK COMPLETE");
        assert_eq!(config.queue.max_concurrent, 4);
        assert_eq!(config.queue.lease_secs, 900);
        assert_eq!(config.session.segment_threshold, 65536);
        assert_eq!(config.escalation.mode, EscalationMode::Interactive);
        assert!(config.verifier.command.is_none());
    }

    #[test]
    fn test_parse_partial_sections() {
        let config = RatchetToml::parse(
            r#"
[defaults]
iteration_budget = 8

[escalation]
mode = "headless"

[verifier]
command = "make check"
"#,
        )
        .unwrap();
        assert_eq!(config.defaults.iteration_budget, 8);
        assert_eq!(config.defaults.completion_sentinel, "TASK COMPLETE");
        assert_eq!(config.escalation.mode, EscalationMode::Headless);
        assert_eq!(config.escalation.poll_interval_ms, 2000);
        assert_eq!(config.verifier.command.as_deref(), Some("make check"));
        assert_eq!(config.verifier.timeout_secs, 600);
    }

    #[test]
    fn test_parse_rejects_unknown_mode() {
        let result = RatchetToml::parse("[escalation]\nmode = \"sometimes\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = RatchetToml::default();
        config
            .apply_env_with(env(&[
                (ENV_WORKER_CMD, "my-agent"),
                (ENV_VERIFY_CMD, "cargo test"),
                (ENV_ESCALATION_MODE, "HEADLESS"),
                (ENV_MAX_CONCURRENT, "9"),
            ]))
            .unwrap();
        assert_eq!(config.worker.command, "my-agent");
        assert_eq!(config.verifier.command.as_deref(), Some("cargo test"));
        assert_eq!(config.escalation.mode, EscalationMode::Headless);
        assert_eq!(config.queue.max_concurrent, 9);
    }

    #[test]
    fn test_env_blank_command_ignored() {
        let mut config = RatchetToml::default();
        config.apply_env_with(env(&[(ENV_WORKER_CMD, "  ")])).unwrap();
        assert_eq!(config.worker.command, "claude --print");
    }

    #[test]
    fn test_env_invalid_values_error() {
        let mut config = RatchetToml::default();
        let err = config
            .apply_env_with(env(&[(ENV_MAX_CONCURRENT, "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_MAX_CONCURRENT));

        let mut config = RatchetToml::default();
        assert!(config.apply_env_with(env(&[(ENV_ESCALATION_MODE, "maybe")])).is_err());
    }

    #[test]
    fn test_validate_defaults_only_warns_about_verifier() {
        let warnings = RatchetToml::default().validate();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("verifier.command"));
    }

    #[test]
    fn test_validate_flags_bad_values() {
        let mut config = RatchetToml::default();
        config.verifier.command = Some("true".into());
        config.defaults.iteration_budget = 0;
        config.queue.max_concurrent = 0;
        config.session.summary_chars = 100_000;
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("iteration_budget")));
        assert!(warnings.iter().any(|w| w.contains("max_concurrent")));
        assert!(warnings.iter().any(|w| w.contains("summary_chars")));
    }

    #[test]
    fn test_settings_conversions() {
        let mut config = RatchetToml::default();
        config.queue.max_concurrent = 0;
        config.iteration.timeout_secs = 30;
        config.iteration.infra_backoff_ms = 250;

        let controller = config.controller_settings();
        assert_eq!(controller.worker_timeout, Duration::from_secs(30));
        assert_eq!(controller.infra_backoff, Duration::from_millis(250));
        assert_eq!(controller.summary_chars, 4000);

        let driver = config.driver_settings(true);
        assert_eq!(driver.max_concurrent, 1);
        assert!(driver.watch);
        assert_eq!(config.lease(), Duration::from_secs(900));
    }

    #[test]
    fn test_load_and_save() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);

        let mut config = RatchetToml::default();
        config.defaults.priority = 3;
        config.verifier.command = Some("./verify.sh".into());
        config.save(&path).unwrap();

        let loaded = RatchetToml::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let config = RatchetToml::load_or_default(dir.path()).unwrap();
        assert_eq!(config, RatchetToml::default());
    }

    #[test]
    fn test_ratchet_config_cli_overrides() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".ratchet")).unwrap();
        std::fs::write(
            dir.path().join(".ratchet").join(CONFIG_FILE),
            "[queue]\nmax_concurrent = 2\n",
        )
        .unwrap();

        let config =
            RatchetConfig::with_cli_args(dir.path().to_path_buf(), true, true, Some(6)).unwrap();
        assert!(config.verbose);
        assert_eq!(config.escalation_mode(), EscalationMode::Headless);
        assert_eq!(config.toml.queue.max_concurrent, 6);
        assert_eq!(
            config.config_file(),
            dir.path().canonicalize().unwrap().join(".ratchet/ratchet.toml")
        );
    }
}
