//! Iteration controller: one bounded retry loop per task-run.
//!
//! ```text
//! INIT -> RUNNING -> COMPLETED
//!                 -> RETRY -> RUNNING
//!                 -> ASK_HUMAN
//!                 -> ABORTED
//! ```
//!
//! Every transition appends exactly one checkpoint (committed together with
//! the task's status change) and then saves the session head. `start`
//! reconciles the head with the checkpoint stream, so a crash between the
//! two writes never replays a checkpointed iteration.
//!
//! Storage calls that fail transiently are retried with the infra backoff
//! and never touch the iteration budget. When the retries run out the run
//! goes to ASK_HUMAN with `infra_exhausted` instead of ending with an error
//! while it still owns the task.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ratchet_common::{
    ChangeSet, Checkpoint, DecisionRequest, RunPhase, SessionRecord, Task, TaskStatus, Transition,
    Verdict, VerdictKind, reasons,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{ControllerError, OutcomeClass, QueueError, SessionError, Transient};
use crate::escalation::{Escalation, Resolution};
use crate::queue::{StatusChange, WorkQueue};
use crate::session::SessionStore;
use crate::signals::WorkerSignals;
use crate::verify::{Baseline, Verifier};
use crate::worker::{Worker, WorkerInput, WorkerOutput};

const EXCERPT_LINES: usize = 3;
const EXCERPT_LINE_CHARS: usize = 160;

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Wall-clock limit per worker invocation. Exceeding it is FAIL("timeout").
    pub worker_timeout: Duration,
    /// Consecutive infra failures tolerated per call (worker, verifier or
    /// storage) before escalating.
    pub infra_retries: u32,
    pub infra_backoff: Duration,
    pub infra_backoff_max: Duration,
    /// Characters of narrative handed to the worker.
    pub summary_chars: usize,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            worker_timeout: Duration::from_secs(1800),
            infra_retries: 3,
            infra_backoff: Duration::from_millis(500),
            infra_backoff_max: Duration::from_secs(30),
            summary_chars: 4000,
        }
    }
}

impl ControllerSettings {
    /// Delay before retry number `failures` (1-based): doubles each time, capped.
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        self.infra_backoff
            .saturating_mul(factor)
            .min(self.infra_backoff_max)
    }
}

/// Result of one `step`.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Retry {
        iteration: u32,
        verdict: Verdict,
        class: OutcomeClass,
    },
    Completed {
        iteration: u32,
    },
    AskHuman {
        iteration: u32,
        request: DecisionRequest,
        class: OutcomeClass,
        /// Present when headless mode resolved the request immediately.
        resolution: Option<Box<Resolution>>,
    },
    Aborted {
        iteration: u32,
    },
}

impl StepOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Retry { .. })
    }

    pub fn transition(&self) -> Transition {
        match self {
            Self::Retry { .. } => Transition::Retry,
            Self::Completed { .. } => Transition::Completed,
            Self::AskHuman { .. } => Transition::AskHuman,
            Self::Aborted { .. } => Transition::Aborted,
        }
    }

    pub fn iteration(&self) -> u32 {
        match self {
            Self::Retry { iteration, .. }
            | Self::Completed { iteration }
            | Self::AskHuman { iteration, .. }
            | Self::Aborted { iteration } => *iteration,
        }
    }
}

/// State of one task-run, threaded through every controller call.
#[derive(Debug)]
pub struct TaskRun {
    task: Task,
    session: SessionRecord,
    owner: String,
    finished: bool,
    /// False when the stored head could not be read; it is then never
    /// overwritten by this run.
    head_loaded: bool,
    /// Storage failure from `start`, escalated by the first `step`.
    deferred_infra: Option<String>,
}

impl TaskRun {
    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn session(&self) -> &SessionRecord {
        &self.session
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Context for the next iteration, rebuilt from the session head only.
    pub fn worker_input(&self, summary_chars: usize) -> WorkerInput {
        WorkerInput {
            task_id: self.task.id.clone(),
            description: self.task.description.clone(),
            summary: self.session.summary(summary_chars),
            next_steps: self.session.next_steps.clone(),
            iteration: self.session.iteration_count + 1,
            iteration_budget: self.task.iteration_budget,
            completion_sentinel: self.task.completion_sentinel.clone(),
        }
    }
}

enum WorkerAttempt {
    Output(WorkerOutput),
    TimedOut,
    Exhausted(String),
}

#[derive(Clone)]
pub struct IterationController {
    queue: WorkQueue,
    sessions: Arc<dyn SessionStore>,
    escalation: Escalation,
    worker: Arc<dyn Worker>,
    verifier: Arc<dyn Verifier>,
    settings: ControllerSettings,
}

impl IterationController {
    pub fn new(
        queue: WorkQueue,
        sessions: Arc<dyn SessionStore>,
        escalation: Escalation,
        worker: Arc<dyn Worker>,
        verifier: Arc<dyn Verifier>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            queue,
            sessions,
            escalation,
            worker,
            verifier,
            settings,
        }
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn shares_work_tree(&self) -> bool {
        self.worker.shares_work_tree()
    }

    /// INIT: load (or create) the session head for a task `owner` holds.
    pub async fn start(&self, task: Task, owner: &str) -> Result<TaskRun, ControllerError> {
        if task.status != TaskStatus::InProgress || task.owner.as_deref() != Some(owner) {
            return Err(ControllerError::NotRunnable {
                id: task.id.clone(),
                status: task.status,
            });
        }

        let mut deferred_infra = None;
        let mut head_loaded = true;
        let sessions = &self.sessions;
        let task_id = task.id.as_str();
        let loaded = self
            .with_storage_retry(task_id, "session load", move || sessions.load(task_id))
            .await;
        let (mut session, resumed) = match loaded {
            Ok(session) => (session, true),
            Err(SessionError::NotFound { .. }) => (SessionRecord::fresh(&task.id), false),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "session head unreadable");
                head_loaded = false;
                deferred_infra = Some(format!("session load failed: {}", e));
                (SessionRecord::fresh(&task.id), false)
            }
        };

        let queue = &self.queue;
        let last = self
            .with_storage_retry(task_id, "checkpoint read", move || queue.last_checkpoint(task_id))
            .await?;
        let consumed = last
            .as_ref()
            .map(|cp| cp.iteration)
            .unwrap_or(0)
            .max(task.retry_count);
        if consumed > session.iteration_count {
            warn!(
                task_id = %task.id,
                session_iteration = session.iteration_count,
                checkpoint_iteration = consumed,
                "session head is behind the checkpoint stream, adopting checkpointed iteration"
            );
            session.iteration_count = consumed;
            if let Some(verdict) = last.and_then(|cp| cp.verdict) {
                session.last_verdict = Some(verdict);
            }
            session.append_narrative(&format!("iteration {}: recovered from checkpoint", consumed));
        }

        if resumed {
            info!(
                task_id = %task.id,
                owner,
                iteration = session.iteration_count,
                budget = task.iteration_budget,
                "resuming task"
            );
        } else {
            info!(
                task_id = %task.id,
                owner,
                budget = task.iteration_budget,
                "starting task"
            );
        }

        let mut run = TaskRun {
            task,
            session,
            owner: owner.to_string(),
            finished: false,
            head_loaded,
            deferred_infra,
        };
        run.session.phase = RunPhase::Running;
        if run.deferred_infra.is_none()
            && let Err(e) = self.save(&mut run).await
        {
            run.deferred_infra = Some(format!("session save failed: {}", e));
        }
        Ok(run)
    }

    /// Run one iteration (or escalate when none may run).
    pub async fn step(&self, run: &mut TaskRun) -> Result<StepOutcome, ControllerError> {
        if run.finished {
            return Err(ControllerError::Finished {
                id: run.task.id.clone(),
            });
        }

        let budget = run.task.iteration_budget;
        let consumed = run.session.iteration_count;
        if let Some(error) = run.deferred_infra.take() {
            return self.storage_exhausted(run, consumed, error).await;
        }
        if consumed >= budget {
            run.session
                .append_narrative(&format!("budget of {} iterations already spent", budget));
            return self
                .ask_human(
                    run,
                    consumed,
                    None,
                    reasons::BUDGET_EXHAUSTED,
                    Vec::new(),
                    OutcomeClass::BudgetExhausted,
                )
                .await;
        }

        let iteration = consumed + 1;
        let input = run.worker_input(self.settings.summary_chars);
        info!(task_id = %run.task.id, iteration, budget, "iteration started");

        let output = match self.invoke_worker(&input).await {
            WorkerAttempt::Output(output) => Some(output),
            WorkerAttempt::TimedOut => None,
            WorkerAttempt::Exhausted(error) => {
                run.session
                    .append_narrative(&format!("iteration {}: worker unavailable: {}", iteration, error));
                return self
                    .ask_human(
                        run,
                        consumed,
                        None,
                        reasons::INFRA_EXHAUSTED,
                        vec![error],
                        OutcomeClass::TransientInfra,
                    )
                    .await;
            }
        };

        let (verdict, next_steps) = match &output {
            None => (Verdict::fail(reasons::TIMEOUT), Vec::new()),
            Some(output) => {
                run.session.last_change_set = Some(ChangeSet {
                    base_ref: output.base_ref.clone(),
                    artifacts: output.changed_artifacts.clone(),
                });
                let signals = WorkerSignals::parse(&output.text, &run.task.completion_sentinel);
                let baseline = Baseline::new(
                    &run.task.id,
                    iteration,
                    run.session.waivers.clone(),
                    &output.changed_artifacts,
                );
                let verdict = match self.invoke_verifier(&output.changed_artifacts, &baseline).await {
                    Ok(verdict) => verdict,
                    Err(error) => {
                        run.session.append_narrative(&format!(
                            "iteration {}: verification unavailable: {}",
                            iteration, error
                        ));
                        return self
                            .ask_human(
                                run,
                                consumed,
                                None,
                                reasons::INFRA_EXHAUSTED,
                                vec![error],
                                OutcomeClass::TransientInfra,
                            )
                            .await;
                    }
                };
                run.session.waivers.clear();
                (judge(verdict, &baseline, signals.sentinel_found), signals.next_steps)
            }
        };

        debug!(task_id = %run.task.id, iteration, verdict = %verdict, "verdict");

        run.session.iteration_count = iteration;
        run.session.last_verdict = Some(verdict.clone());
        run.session.append_narrative(&narrative_entry(
            iteration,
            &verdict,
            output.as_ref().map(|o| o.text.as_str()),
        ));
        run.session.next_steps = if !next_steps.is_empty() {
            next_steps
        } else if verdict.is_pass() || verdict.reason.is_empty() {
            Vec::new()
        } else {
            vec![verdict.reason.clone()]
        };

        match verdict.kind {
            VerdictKind::Blocked => {
                let reason = verdict.trigger().to_string();
                let evidence = verdict.evidence.clone();
                self.ask_human(
                    run,
                    iteration,
                    Some(verdict),
                    &reason,
                    evidence,
                    OutcomeClass::GuardrailViolation,
                )
                .await
            }
            VerdictKind::Pass => {
                let checkpoint = Checkpoint::new(&run.task.id, iteration, Transition::Completed)
                    .with_verdict(verdict);
                run.task = match self.commit(run, checkpoint, StatusChange::Complete).await {
                    Ok(task) => task,
                    Err(e) if e.is_transient() => {
                        return self
                            .storage_exhausted(run, consumed, format!("checkpoint write failed: {}", e))
                            .await;
                    }
                    Err(e) => return Err(e.into()),
                };
                run.session.phase = RunPhase::Completed;
                run.finished = true;
                self.save_after_commit(run).await;
                info!(task_id = %run.task.id, iteration, "task completed");
                Ok(StepOutcome::Completed { iteration })
            }
            VerdictKind::Fail if iteration < budget => {
                let checkpoint = Checkpoint::new(&run.task.id, iteration, Transition::Retry)
                    .with_verdict(verdict.clone());
                run.task = match self.commit(run, checkpoint, StatusChange::Continue).await {
                    Ok(task) => task,
                    Err(e) if e.is_transient() => {
                        return self
                            .storage_exhausted(run, consumed, format!("checkpoint write failed: {}", e))
                            .await;
                    }
                    Err(e) => return Err(e.into()),
                };
                run.session.phase = RunPhase::Retry;
                if let Err(e) = self.save(run).await {
                    // The FAIL is checkpointed; escalate from the consumed iteration.
                    return self
                        .storage_exhausted(run, iteration, format!("session save failed: {}", e))
                        .await;
                }
                info!(
                    task_id = %run.task.id,
                    iteration,
                    remaining = budget - iteration,
                    reason = %verdict.reason,
                    "iteration failed, retrying"
                );
                Ok(StepOutcome::Retry {
                    iteration,
                    verdict,
                    class: OutcomeClass::RegressionFailure,
                })
            }
            VerdictKind::Fail => {
                let evidence = verdict.evidence.clone();
                self.ask_human(
                    run,
                    iteration,
                    Some(verdict),
                    reasons::BUDGET_EXHAUSTED,
                    evidence,
                    OutcomeClass::BudgetExhausted,
                )
                .await
            }
        }
    }

    /// ABORTED: cancellation between iterations. The checkpoint is
    /// recoverable and the task goes back to pending.
    pub async fn abort(&self, run: &mut TaskRun) -> Result<StepOutcome, ControllerError> {
        if run.finished {
            return Err(ControllerError::Finished {
                id: run.task.id.clone(),
            });
        }
        let iteration = run.session.iteration_count;
        let checkpoint = Checkpoint::new(&run.task.id, iteration, Transition::Aborted)
            .with_reason(reasons::CANCELLED);
        run.task = self.commit(run, checkpoint, StatusChange::Release).await?;
        run.session.phase = RunPhase::Aborted;
        run.session
            .append_narrative(&format!("cancelled after iteration {}", iteration));
        run.finished = true;
        self.save_after_commit(run).await;
        info!(task_id = %run.task.id, iteration, "task-run cancelled, released to queue");
        Ok(StepOutcome::Aborted { iteration })
    }

    /// Start the run and step it until a terminal transition, aborting when
    /// `cancel` fires between iterations.
    pub async fn run(
        &self,
        task: Task,
        owner: &str,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, ControllerError> {
        let mut run = self.start(task, owner).await?;
        loop {
            if cancel.is_cancelled() {
                return self.abort(&mut run).await;
            }
            let outcome = self.step(&mut run).await?;
            if outcome.is_terminal() {
                return Ok(outcome);
            }
        }
    }

    async fn ask_human(
        &self,
        run: &mut TaskRun,
        iteration: u32,
        verdict: Option<Verdict>,
        reason: &str,
        evidence: Vec<String>,
        class: OutcomeClass,
    ) -> Result<StepOutcome, ControllerError> {
        let mut checkpoint =
            Checkpoint::new(&run.task.id, iteration, Transition::AskHuman).with_reason(reason);
        if let Some(verdict) = verdict {
            checkpoint = checkpoint.with_verdict(verdict);
        }
        let escalation = &self.escalation;
        let owner = run.owner.as_str();
        let request = self
            .with_storage_retry(&run.task.id, "escalation", move || {
                escalation.escalate(owner, checkpoint.clone(), reason, evidence.clone())
            })
            .await?;
        run.task.status = TaskStatus::Blocked;
        run.task.owner = None;
        run.session.phase = RunPhase::AskHuman;
        run.finished = true;
        self.save_after_commit(run).await;

        let resolution = self.escalation.auto_resolve(&request).await?;
        Ok(StepOutcome::AskHuman {
            iteration,
            request,
            class,
            resolution: resolution.map(Box::new),
        })
    }

    /// ASK_HUMAN with `infra_exhausted` after storage kept failing.
    async fn storage_exhausted(
        &self,
        run: &mut TaskRun,
        iteration: u32,
        error: String,
    ) -> Result<StepOutcome, ControllerError> {
        // An iteration whose checkpoint never committed is not consumed.
        run.session.iteration_count = iteration;
        run.session
            .append_narrative(&format!("iteration {}: storage unavailable: {}", iteration, error));
        self.ask_human(
            run,
            iteration,
            None,
            reasons::INFRA_EXHAUSTED,
            vec![error],
            OutcomeClass::TransientInfra,
        )
        .await
    }

    /// Append the checkpoint and apply the status change as one transaction.
    async fn commit(
        &self,
        run: &TaskRun,
        checkpoint: Checkpoint,
        change: StatusChange,
    ) -> Result<Task, QueueError> {
        let queue = &self.queue;
        let owner = run.owner.as_str();
        self.with_storage_retry(&run.task.id, "checkpoint write", move || {
            queue.record_transition(owner, checkpoint.clone(), change.clone())
        })
        .await
    }

    async fn save(&self, run: &mut TaskRun) -> Result<(), SessionError> {
        if !run.head_loaded {
            debug!(task_id = %run.task.id, "stored head unreadable, not overwriting it");
            return Ok(());
        }
        run.session.touch();
        let sessions = &self.sessions;
        let record = &run.session;
        let outcome = self
            .with_storage_retry(&run.task.id, "session save", move || sessions.save(record))
            .await?;
        if let Some(index) = outcome.sealed_segment {
            debug!(task_id = %run.task.id, segment = index, "sealed session segment");
        }
        run.session = outcome.head;
        Ok(())
    }

    /// Save once the queue already holds the terminal transition. A head
    /// that stays unsaved is reconciled from checkpoints on the next start.
    async fn save_after_commit(&self, run: &mut TaskRun) {
        if let Err(e) = self.save(run).await {
            warn!(
                task_id = %run.task.id,
                error = %e,
                "session head not saved after transition, will be reconciled from checkpoints"
            );
        }
    }

    /// Retry `op` with the infra backoff while it fails transiently.
    async fn with_storage_retry<T, E, F, Fut>(&self, task_id: &str, what: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + Display,
    {
        let mut failures = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && failures < self.settings.infra_retries => {
                    failures += 1;
                    let delay = self.settings.backoff(failures);
                    warn!(
                        task_id,
                        operation = what,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "storage unavailable, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn invoke_worker(&self, input: &WorkerInput) -> WorkerAttempt {
        let mut failures = 0u32;
        loop {
            match tokio::time::timeout(self.settings.worker_timeout, self.worker.run(input)).await {
                Err(_) => {
                    warn!(
                        task_id = %input.task_id,
                        iteration = input.iteration,
                        timeout_secs = self.settings.worker_timeout.as_secs(),
                        "worker timed out"
                    );
                    return WorkerAttempt::TimedOut;
                }
                Ok(Ok(output)) => return WorkerAttempt::Output(output),
                Ok(Err(e)) => {
                    failures += 1;
                    if failures > self.settings.infra_retries {
                        return WorkerAttempt::Exhausted(e.to_string());
                    }
                    let delay = self.settings.backoff(failures);
                    warn!(
                        task_id = %input.task_id,
                        iteration = input.iteration,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "worker unavailable, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn invoke_verifier(
        &self,
        changed: &[std::path::PathBuf],
        baseline: &Baseline,
    ) -> Result<Verdict, String> {
        let mut failures = 0u32;
        loop {
            match self.verifier.verify(changed, baseline).await {
                Ok(verdict) => return Ok(verdict),
                Err(e) => {
                    failures += 1;
                    if failures > self.settings.infra_retries {
                        return Err(e.to_string());
                    }
                    let delay = self.settings.backoff(failures);
                    warn!(
                        task_id = %baseline.task_id,
                        iteration = baseline.iteration,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "verification unavailable, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Apply waivers and the sentinel rule to a raw verdict.
fn judge(verdict: Verdict, baseline: &Baseline, sentinel_found: bool) -> Verdict {
    let verdict = if verdict.is_blocked() && baseline.is_waived(verdict.trigger()) {
        Verdict::pass(format!("waived: {}", verdict.trigger())).with_evidence(verdict.evidence)
    } else {
        verdict
    };
    if verdict.is_pass() && !sentinel_found {
        Verdict::fail(reasons::SENTINEL_MISSING).with_evidence(verdict.evidence)
    } else {
        verdict
    }
}

fn narrative_entry(iteration: u32, verdict: &Verdict, output: Option<&str>) -> String {
    let mut entry = format!("iteration {}: {}", iteration, verdict.kind);
    if !verdict.reason.is_empty() {
        entry.push_str(": ");
        entry.push_str(&verdict.reason);
    }
    if let Some(text) = output {
        let lines: Vec<&str> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        for line in &lines[lines.len().saturating_sub(EXCERPT_LINES)..] {
            entry.push_str("\n  > ");
            entry.extend(line.chars().take(EXCERPT_LINE_CHARS));
        }
    }
    entry
}
