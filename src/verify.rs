//! Verification engine contract and the shell-command adapter.
//!
//! The engine judges the artifacts a worker changed and returns PASS, FAIL or
//! BLOCKED. Being unreachable, erroring or timing out is a `VerifyError`, not
//! a verdict, so the controller can retry it without spending budget.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use ratchet_common::{Verdict, VerdictKind};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::errors::VerifyError;

/// What the changed artifacts are judged against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Baseline {
    pub task_id: String,
    pub iteration: u32,
    /// Guardrail triggers a human has overridden for this verification.
    pub waivers: Vec<String>,
    /// Stable hash of the changed artifact list.
    pub fingerprint: String,
}

impl Baseline {
    pub fn new(task_id: &str, iteration: u32, waivers: Vec<String>, changed: &[PathBuf]) -> Self {
        Self {
            task_id: task_id.to_string(),
            iteration,
            waivers,
            fingerprint: fingerprint(changed),
        }
    }

    pub fn is_waived(&self, reason: &str) -> bool {
        self.waivers.iter().any(|w| w == reason)
    }
}

/// SHA-256 over the sorted artifact paths, hex encoded.
pub fn fingerprint(changed: &[PathBuf]) -> String {
    let mut paths: Vec<String> = changed
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    paths.sort();
    let mut hasher = Sha256::new();
    for path in &paths {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, changed: &[PathBuf], baseline: &Baseline) -> Result<Verdict, VerifyError>;
}

#[derive(Serialize)]
struct VerifyRequest<'a> {
    task_id: &'a str,
    iteration: u32,
    changed_artifacts: &'a [PathBuf],
    waivers: &'a [String],
    fingerprint: &'a str,
}

/// Runs a shell command with the request as JSON on stdin.
///
/// - stdout parsing as a `Verdict` wins over the exit code
/// - exit 0 = PASS, 1 = FAIL, 2 = BLOCKED
/// - any other exit, a signal or the timeout = `VerifyError`
pub struct CommandVerifier {
    command: String,
    working_dir: PathBuf,
    timeout: Duration,
}

impl CommandVerifier {
    pub fn new(command: impl Into<String>, working_dir: impl AsRef<Path>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            working_dir: working_dir.as_ref().to_path_buf(),
            timeout,
        }
    }

    fn parse_output(&self, output: &std::process::Output) -> Result<Verdict, VerifyError> {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if let Ok(verdict) = serde_json::from_str::<Verdict>(stdout.trim()) {
            return Ok(verdict);
        }

        let reason = if !stdout.trim().is_empty() {
            last_line(&stdout)
        } else {
            last_line(&stderr)
        };
        let kind = match output.status.code() {
            Some(0) => VerdictKind::Pass,
            Some(1) => VerdictKind::Fail,
            Some(2) => VerdictKind::Blocked,
            Some(code) => {
                return Err(VerifyError::Unavailable(format!(
                    "verifier exited with code {}: {}",
                    code,
                    stderr.trim()
                )));
            }
            None => {
                return Err(VerifyError::Unavailable(
                    "verifier terminated by signal".to_string(),
                ));
            }
        };
        Ok(Verdict::new(kind, reason))
    }
}

fn last_line(text: &str) -> String {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl Verifier for CommandVerifier {
    async fn verify(&self, changed: &[PathBuf], baseline: &Baseline) -> Result<Verdict, VerifyError> {
        let request = VerifyRequest {
            task_id: &baseline.task_id,
            iteration: baseline.iteration,
            changed_artifacts: changed,
            waivers: &baseline.waivers,
            fingerprint: &baseline.fingerprint,
        };
        let request_json = serde_json::to_string(&request)
            .map_err(|e| VerifyError::Unavailable(format!("failed to encode request: {}", e)))?;

        debug!(
            task_id = %baseline.task_id,
            iteration = baseline.iteration,
            command = %self.command,
            "running verifier"
        );

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("RATCHET_TASK_ID", &baseline.task_id)
            .env("RATCHET_ITERATION", baseline.iteration.to_string())
            .env("RATCHET_WAIVERS", baseline.waivers.join("\n"))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VerifyError::Unavailable(format!("failed to spawn verifier: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A verifier that ignores stdin may close it early; that is fine.
            let _ = stdin.write_all(request_json.as_bytes()).await;
        }

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result
                .map_err(|e| VerifyError::Unavailable(format!("failed to wait for verifier: {}", e)))?,
            Err(_) => {
                return Err(VerifyError::Timeout {
                    secs: self.timeout.as_secs(),
                });
            }
        };

        self.parse_output(&output)
    }
}
