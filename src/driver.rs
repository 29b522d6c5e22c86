//! Driver loop: pull ready tasks and hand each to the iteration controller.
//!
//! Global ceilings live here and never in the controller: a `Semaphore`
//! bounds concurrent task-runs in this process, the same number is passed to
//! `dequeue_ready` as the queue-wide in-progress ceiling, and an
//! `IterationRateLimiter` bounds iterations per time window. Cancellation is
//! observed only between iterations.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ratchet_common::{Task, Transition, Verdict};
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::controller::{IterationController, StepOutcome};
use crate::errors::QueueError;
use crate::queue::WorkQueue;

/// Sliding-window limit on iterations started, shared by every task-run of
/// a driver. `max == 0` disables it.
pub struct IterationRateLimiter {
    max: usize,
    window: Duration,
    started: Mutex<VecDeque<Instant>>,
}

impl IterationRateLimiter {
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            max,
            window,
            started: Mutex::new(VecDeque::new()),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Reserve a slot, or report how long until one frees up.
    fn try_reserve(&self) -> Result<(), Duration> {
        if self.max == 0 {
            return Ok(());
        }
        let now = Instant::now();
        let mut started = match self.started.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while let Some(&first) = started.front() {
            if now.duration_since(first) >= self.window {
                started.pop_front();
            } else {
                break;
            }
        }
        if started.len() < self.max {
            started.push_back(now);
            return Ok(());
        }
        let oldest = started.front().copied().unwrap_or(now);
        Err(self.window.saturating_sub(now.duration_since(oldest)))
    }

    /// Wait for a slot. Returns `false` if `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> bool {
        loop {
            match self.try_reserve() {
                Ok(()) => return true,
                Err(wait) => {
                    debug!(wait_ms = wait.as_millis() as u64, "iteration rate limit reached");
                    tokio::select! {
                        _ = cancel.cancelled() => return false,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub max_concurrent: usize,
    /// Sleep between polls when nothing is ready.
    pub idle_poll: Duration,
    /// Keep polling after the queue drains instead of returning.
    pub watch: bool,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            idle_poll: Duration::from_secs(1),
            watch: false,
        }
    }
}

/// Progress notifications for UIs.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    Claimed {
        task_id: String,
        resumed: bool,
        iteration: u32,
        budget: u32,
    },
    IterationFinished {
        task_id: String,
        iteration: u32,
        transition: Transition,
        verdict: Option<Verdict>,
    },
    Completed {
        task_id: String,
        iterations: u32,
    },
    Escalated {
        task_id: String,
        request_id: i64,
        reason: String,
        auto_resolved: bool,
    },
    Released {
        task_id: String,
    },
    Errored {
        task_id: String,
        message: String,
    },
    LeasesReaped {
        task_ids: Vec<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverSummary {
    pub completed: Vec<String>,
    pub escalated: Vec<String>,
    /// Escalations headless mode resolved on the spot.
    pub auto_resolved: Vec<String>,
    pub released: Vec<String>,
    pub errored: Vec<String>,
    pub iterations: u32,
}

impl DriverSummary {
    fn record(&mut self, report: TaskReport) {
        self.iterations += report.iterations;
        match report.outcome {
            Ok(StepOutcome::Completed { .. }) => self.completed.push(report.task_id),
            Ok(StepOutcome::AskHuman { resolution, .. }) => {
                if resolution.is_some() {
                    self.auto_resolved.push(report.task_id.clone());
                }
                self.escalated.push(report.task_id);
            }
            Ok(StepOutcome::Aborted { .. }) => self.released.push(report.task_id),
            Ok(StepOutcome::Retry { .. }) | Err(_) => self.errored.push(report.task_id),
        }
    }
}

struct TaskReport {
    task_id: String,
    iterations: u32,
    outcome: Result<StepOutcome, String>,
}

#[derive(Clone)]
struct TaskContext {
    owner: String,
    queue: WorkQueue,
    controller: IterationController,
    limiter: Arc<IterationRateLimiter>,
    events: Option<mpsc::Sender<DriverEvent>>,
}

impl TaskContext {
    async fn emit(&self, event: DriverEvent) {
        if let Some(tx) = &self.events {
            tx.send(event).await.ok();
        }
    }
}

pub struct Driver {
    ctx: TaskContext,
    settings: DriverSettings,
}

impl Driver {
    pub fn new(
        queue: WorkQueue,
        controller: IterationController,
        limiter: IterationRateLimiter,
        settings: DriverSettings,
    ) -> Self {
        Self {
            ctx: TaskContext {
                owner: format!("driver-{}", Uuid::new_v4()),
                queue,
                controller,
                limiter: Arc::new(limiter),
                events: None,
            },
            settings,
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.ctx.owner = owner.into();
        self
    }

    pub fn with_event_channel(mut self, tx: mpsc::Sender<DriverEvent>) -> Self {
        self.ctx.events = Some(tx);
        self
    }

    pub fn owner(&self) -> &str {
        &self.ctx.owner
    }

    /// Dispatch until the queue has nothing runnable (or, in watch mode,
    /// until `cancel` fires), then drain in-flight task-runs.
    pub async fn run(&self, cancel: CancellationToken) -> Result<DriverSummary, QueueError> {
        let mut max_concurrent = self.settings.max_concurrent.max(1);
        if max_concurrent > 1 && self.ctx.controller.shares_work_tree() {
            warn!(
                requested = max_concurrent,
                "worker tracks changes in a shared work tree, running one task at a time"
            );
            max_concurrent = 1;
        }
        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        let mut join_set: JoinSet<TaskReport> = JoinSet::new();
        let mut summary = DriverSummary::default();

        info!(
            owner = %self.ctx.owner,
            max_concurrent,
            watch = self.settings.watch,
            "driver started"
        );

        loop {
            if cancel.is_cancelled() {
                info!("cancellation requested, stopping dispatch");
                break;
            }

            while let Some(result) = join_set.try_join_next() {
                reap(result, &mut summary);
            }

            let reaped = self.ctx.queue.reap_expired_leases().await?;
            if !reaped.is_empty() {
                warn!(tasks = ?reaped, "reclaimed tasks with expired leases");
                self.ctx
                    .emit(DriverEvent::LeasesReaped { task_ids: reaped })
                    .await;
            }

            let dispatched = match semaphore.clone().try_acquire_owned() {
                Ok(permit) => match self.claim(max_concurrent).await? {
                    Some((task, resumed)) => {
                        let ctx = self.ctx.clone();
                        let cancel = cancel.clone();
                        join_set.spawn(async move {
                            let _permit = permit;
                            drive_task(ctx, task, resumed, cancel).await
                        });
                        true
                    }
                    None => false,
                },
                Err(_) => false,
            };

            if dispatched {
                continue;
            }
            if join_set.is_empty() && !self.settings.watch {
                info!("no runnable tasks and none in flight, exiting");
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("cancellation requested while waiting");
                    break;
                }
                Some(result) = join_set.join_next(), if !join_set.is_empty() => {
                    reap(result, &mut summary);
                }
                _ = tokio::time::sleep(self.settings.idle_poll) => {}
            }
        }

        if !join_set.is_empty() {
            info!(count = join_set.len(), "waiting for in-flight task-runs");
            while let Some(result) = join_set.join_next().await {
                reap(result, &mut summary);
            }
        }

        info!(
            completed = summary.completed.len(),
            escalated = summary.escalated.len(),
            released = summary.released.len(),
            errored = summary.errored.len(),
            iterations = summary.iterations,
            "driver stopped"
        );
        Ok(summary)
    }

    /// Unowned in-progress tasks (overridden or reaped) come before new work.
    async fn claim(&self, ceiling: usize) -> Result<Option<(Task, bool)>, QueueError> {
        if let Some(task) = self.ctx.queue.claim_resumed(&self.ctx.owner).await? {
            return Ok(Some((task, true)));
        }
        Ok(self
            .ctx
            .queue
            .dequeue_ready(&self.ctx.owner, ceiling)
            .await?
            .map(|task| (task, false)))
    }
}

fn reap(result: Result<TaskReport, tokio::task::JoinError>, summary: &mut DriverSummary) {
    match result {
        Ok(report) => summary.record(report),
        Err(e) => error!(error = %e, "task-run panicked"),
    }
}

/// Renew the lease until `stop` fires.
async fn heartbeat(queue: WorkQueue, task_id: String, owner: String, stop: CancellationToken) {
    let period = (queue.lease() / 3).max(Duration::from_millis(100));
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = interval.tick() => {
                match queue.renew_lease(&task_id, &owner).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(task_id = %task_id, owner = %owner, "lease no longer held");
                        return;
                    }
                    Err(e) => warn!(task_id = %task_id, error = %e, "failed to renew lease"),
                }
            }
        }
    }
}

async fn drive_task(ctx: TaskContext, task: Task, resumed: bool, cancel: CancellationToken) -> TaskReport {
    let task_id = task.id.clone();
    let stop = CancellationToken::new();
    let beat = tokio::spawn(heartbeat(
        ctx.queue.clone(),
        task_id.clone(),
        ctx.owner.clone(),
        stop.clone(),
    ));

    let mut iterations = 0;
    let outcome = run_task(&ctx, task, resumed, &cancel, &mut iterations).await;

    stop.cancel();
    beat.await.ok();

    match &outcome {
        Ok(StepOutcome::Completed { iteration }) => {
            ctx.emit(DriverEvent::Completed {
                task_id: task_id.clone(),
                iterations: *iteration,
            })
            .await;
        }
        Ok(StepOutcome::AskHuman {
            request, resolution, ..
        }) => {
            ctx.emit(DriverEvent::Escalated {
                task_id: task_id.clone(),
                request_id: request.id,
                reason: request.reason.clone(),
                auto_resolved: resolution.is_some(),
            })
            .await;
        }
        Ok(StepOutcome::Aborted { .. }) => {
            ctx.emit(DriverEvent::Released {
                task_id: task_id.clone(),
            })
            .await;
        }
        Ok(StepOutcome::Retry { .. }) => {}
        Err(message) => {
            error!(task_id = %task_id, error = %message, "task-run failed");
            ctx.emit(DriverEvent::Errored {
                task_id: task_id.clone(),
                message: message.clone(),
            })
            .await;
        }
    }

    TaskReport {
        task_id,
        iterations,
        outcome,
    }
}

async fn run_task(
    ctx: &TaskContext,
    task: Task,
    resumed: bool,
    cancel: &CancellationToken,
    iterations: &mut u32,
) -> Result<StepOutcome, String> {
    let mut run = ctx
        .controller
        .start(task, &ctx.owner)
        .await
        .map_err(|e| e.to_string())?;

    ctx.emit(DriverEvent::Claimed {
        task_id: run.task().id.clone(),
        resumed,
        iteration: run.session().iteration_count,
        budget: run.task().iteration_budget,
    })
    .await;

    loop {
        if cancel.is_cancelled() || !ctx.limiter.acquire(cancel).await {
            return ctx.controller.abort(&mut run).await.map_err(|e| e.to_string());
        }
        let before = run.session().iteration_count;
        let outcome = ctx
            .controller
            .step(&mut run)
            .await
            .map_err(|e| e.to_string())?;
        *iterations += run.session().iteration_count.saturating_sub(before);
        ctx.emit(DriverEvent::IterationFinished {
            task_id: run.task().id.clone(),
            iteration: outcome.iteration(),
            transition: outcome.transition(),
            verdict: run.session().last_verdict.clone(),
        })
        .await;
        if outcome.is_terminal() {
            return Ok(outcome);
        }
    }
}
