use crate::driver::{DriverEvent, DriverSummary};
use crate::ui::icons::{BLOCKER, CHECK, CLOCK, CROSS, PAUSE, RETRY, RUNNING, SPARKLE};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use ratchet_common::Transition;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Terminal UI for `ratchet run`, rendered from driver events.
///
/// A bar at the top counts tasks that reached a resting state; below it
/// each in-flight task has its own spinner with its iteration and last
/// verdict.
pub struct RunUI {
    multi: MultiProgress,
    overall: ProgressBar,
    tasks: Mutex<HashMap<String, ProgressBar>>,
    verbose: bool,
}

impl RunUI {
    /// `total` sizes the overall bar: the number of tasks not yet at rest
    /// when the run starts. It grows if more are claimed.
    pub fn new(total: u64, verbose: bool) -> Self {
        Self::with_target(total, verbose, ProgressDrawTarget::stderr())
    }

    /// A UI that draws nothing, for tests and `--quiet`.
    pub fn hidden() -> Self {
        Self::with_target(0, false, ProgressDrawTarget::hidden())
    }

    fn with_target(total: u64, verbose: bool, target: ProgressDrawTarget) -> Self {
        let multi = MultiProgress::with_draw_target(target);

        let overall_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");
        let overall = multi.add(ProgressBar::new(total));
        overall.set_style(overall_style);
        overall.set_prefix("Tasks");

        Self {
            multi,
            overall,
            tasks: Mutex::new(HashMap::new()),
            verbose,
        }
    }

    /// Print a line above the bars, falling back to `eprintln!`.
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    fn task_bar(&self, task_id: &str) -> Option<ProgressBar> {
        self.tasks.lock().ok()?.get(task_id).cloned()
    }

    fn finish_task(&self, task_id: &str, message: String) {
        let bar = self.tasks.lock().ok().and_then(|mut t| t.remove(task_id));
        if let Some(bar) = bar {
            bar.finish_and_clear();
            self.multi.remove(&bar);
        }
        self.overall.inc(1);
        self.print_line(message);
    }

    pub fn handle(&self, event: &DriverEvent) {
        match event {
            DriverEvent::Claimed {
                task_id,
                resumed,
                iteration,
                budget,
            } => {
                let spinner_style = ProgressStyle::default_spinner()
                    .template("{prefix:.bold} {spinner} {msg}")
                    .expect("progress bar template is a valid static string");
                let bar = self.multi.add(ProgressBar::new_spinner());
                bar.set_style(spinner_style);
                bar.set_prefix(task_id.clone());
                bar.set_message(format!(
                    "{}iteration {}/{}",
                    if *resumed { "resumed, " } else { "" },
                    style(iteration + 1).cyan(),
                    budget
                ));
                bar.enable_steady_tick(Duration::from_millis(100));
                if self.overall.position() + self.in_flight() as u64 >= self.overall.length().unwrap_or(0) {
                    self.overall.inc_length(1);
                }
                if let Ok(mut tasks) = self.tasks.lock() {
                    tasks.insert(task_id.clone(), bar);
                }
                if self.verbose {
                    self.print_line(format!("{} {} claimed", RUNNING, style(task_id).yellow()));
                }
            }
            DriverEvent::IterationFinished {
                task_id,
                iteration,
                transition,
                verdict,
            } => {
                let reason = verdict
                    .as_ref()
                    .map(|v| format!("{} {}", v.kind.as_str(), v.reason))
                    .unwrap_or_default();
                if let Some(bar) = self.task_bar(task_id) {
                    bar.set_message(format!(
                        "iteration {} {} {}",
                        style(iteration).cyan(),
                        transition,
                        style(&reason).dim()
                    ));
                }
                if self.verbose || *transition == Transition::Retry {
                    self.print_line(format!(
                        "  {} {} iteration {}: {}",
                        RETRY,
                        style(task_id).yellow(),
                        iteration,
                        style(reason).dim()
                    ));
                }
            }
            DriverEvent::Completed {
                task_id,
                iterations,
            } => self.finish_task(
                task_id,
                format!(
                    "{} {} completed after {} iteration(s)",
                    CHECK,
                    style(task_id).green().bold(),
                    iterations
                ),
            ),
            DriverEvent::Escalated {
                task_id,
                request_id,
                reason,
                auto_resolved,
            } => {
                let tail = if *auto_resolved {
                    style("approved by system (headless)").dim().to_string()
                } else {
                    format!("resolve with `ratchet resolve {}`", request_id)
                };
                self.finish_task(
                    task_id,
                    format!(
                        "{} {} needs a decision: {} ({})",
                        BLOCKER,
                        style(task_id).red().bold(),
                        reason,
                        tail
                    ),
                );
            }
            DriverEvent::Released { task_id } => {
                let bar = self.tasks.lock().ok().and_then(|mut t| t.remove(task_id));
                if let Some(bar) = bar {
                    bar.finish_and_clear();
                    self.multi.remove(&bar);
                }
                self.print_line(format!("{} {} released", PAUSE, style(task_id).yellow()));
            }
            DriverEvent::Errored { task_id, message } => self.finish_task(
                task_id,
                format!("{} {} errored: {}", CROSS, style(task_id).red().bold(), message),
            ),
            DriverEvent::LeasesReaped { task_ids } => {
                self.print_line(format!(
                    "{} reclaimed expired leases: {}",
                    CLOCK,
                    task_ids.join(", ")
                ));
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn finished(&self) -> u64 {
        self.overall.position()
    }

    /// Stop every bar and print the run summary.
    pub fn finish(&self, summary: &DriverSummary) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for (_, bar) in tasks.drain() {
                bar.finish_and_clear();
            }
        }
        self.overall.finish_and_clear();
        self.print_line("");
        self.print_line(format!(
            "{} {} completed, {} escalated ({} auto-resolved), {} released, {} errored, {} iterations",
            SPARKLE,
            style(summary.completed.len()).green().bold(),
            style(summary.escalated.len()).red(),
            summary.auto_resolved.len(),
            summary.released.len(),
            summary.errored.len(),
            summary.iterations
        ));
    }
}
