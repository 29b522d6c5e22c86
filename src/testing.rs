//! Scripted collaborators shared by the controller and driver tests.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ratchet_common::{SessionRecord, Verdict};
use tempfile::TempDir;

use crate::controller::{ControllerSettings, IterationController};
use crate::db::{Database, DbHandle};
use crate::errors::{SessionError, VerifyError, WorkerError};
use crate::escalation::{Escalation, EscalationMode};
use crate::queue::WorkQueue;
use crate::session::{FileSessionStore, SaveOutcome, SessionStore};
use crate::tracker::NoopReverter;
use crate::verify::{Baseline, Verifier};
use crate::worker::{Worker, WorkerInput, WorkerOutput};

pub fn output(text: &str) -> WorkerOutput {
    WorkerOutput {
        text: text.to_string(),
        ..Default::default()
    }
}

/// Replays queued results in order; the last one repeats when `repeat` is set.
struct Script<T> {
    queue: VecDeque<T>,
    repeat: Option<T>,
}

impl<T: Clone> Script<T> {
    fn next(&mut self) -> Option<T> {
        self.queue.pop_front().or_else(|| self.repeat.clone())
    }
}

pub struct ScriptedWorker {
    script: Mutex<Script<Result<WorkerOutput, String>>>,
    inputs: Mutex<Vec<WorkerInput>>,
    delay: Option<Duration>,
    shares_work_tree: bool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedWorker {
    pub fn new(outputs: Vec<Result<WorkerOutput, WorkerError>>) -> Self {
        Self::build(outputs, None)
    }

    pub fn repeating(output: Result<WorkerOutput, WorkerError>) -> Self {
        Self::build(Vec::new(), Some(output))
    }

    fn build(outputs: Vec<Result<WorkerOutput, WorkerError>>, repeat: Option<Result<WorkerOutput, WorkerError>>) -> Self {
        let flatten = |r: Result<WorkerOutput, WorkerError>| r.map_err(|e| e.to_string());
        Self {
            script: Mutex::new(Script {
                queue: outputs.into_iter().map(flatten).collect(),
                repeat: repeat.map(flatten),
            }),
            inputs: Mutex::new(Vec::new()),
            delay: None,
            shares_work_tree: false,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn sharing_work_tree(mut self) -> Self {
        self.shares_work_tree = true;
        self
    }

    pub fn inputs(&self) -> Vec<WorkerInput> {
        self.inputs.lock().unwrap().clone()
    }

    /// Most runs that were ever in progress at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    async fn run(&self, input: &WorkerInput) -> Result<WorkerOutput, WorkerError> {
        self.inputs.lock().unwrap().push(input.clone());
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().next();
        match next {
            Some(Ok(output)) => Ok(output),
            Some(Err(message)) => Err(WorkerError::Unavailable(message)),
            None => Err(WorkerError::Unavailable("script exhausted".into())),
        }
    }

    fn shares_work_tree(&self) -> bool {
        self.shares_work_tree
    }
}

pub struct ScriptedVerifier {
    script: Mutex<Script<Result<Verdict, String>>>,
    baselines: Mutex<Vec<Baseline>>,
}

impl ScriptedVerifier {
    pub fn new(verdicts: Vec<Result<Verdict, VerifyError>>) -> Self {
        Self::build(verdicts, None)
    }

    pub fn repeating(verdict: Result<Verdict, VerifyError>) -> Self {
        Self::build(Vec::new(), Some(verdict))
    }

    fn build(verdicts: Vec<Result<Verdict, VerifyError>>, repeat: Option<Result<Verdict, VerifyError>>) -> Self {
        let flatten = |r: Result<Verdict, VerifyError>| r.map_err(|e| e.to_string());
        Self {
            script: Mutex::new(Script {
                queue: verdicts.into_iter().map(flatten).collect(),
                repeat: repeat.map(flatten),
            }),
            baselines: Mutex::new(Vec::new()),
        }
    }

    /// Every baseline the verifier was called with, including failed calls.
    pub fn baselines(&self) -> Vec<Baseline> {
        self.baselines.lock().unwrap().clone()
    }
}

#[async_trait]
impl Verifier for ScriptedVerifier {
    async fn verify(&self, _changed: &[PathBuf], baseline: &Baseline) -> Result<Verdict, VerifyError> {
        self.baselines.lock().unwrap().push(baseline.clone());
        let next = self.script.lock().unwrap().next();
        match next {
            Some(Ok(verdict)) => Ok(verdict),
            Some(Err(message)) => Err(VerifyError::Unavailable(message)),
            None => Err(VerifyError::Unavailable("script exhausted".into())),
        }
    }
}

/// File store whose saves fail with an I/O error when `fail_save` says so
/// (1-based save number), and whose loads fail while `fail_loads` is set.
pub struct FlakySessionStore {
    inner: Arc<FileSessionStore>,
    saves: AtomicUsize,
    fail_save: Box<dyn Fn(usize) -> bool + Send + Sync>,
    fail_loads: bool,
}

impl FlakySessionStore {
    pub fn new(inner: Arc<FileSessionStore>, fail_save: impl Fn(usize) -> bool + Send + Sync + 'static) -> Self {
        Self {
            inner,
            saves: AtomicUsize::new(0),
            fail_save: Box::new(fail_save),
            fail_loads: false,
        }
    }

    pub fn failing_loads(mut self) -> Self {
        self.fail_loads = true;
        self
    }

    pub fn save_attempts(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    fn io_error() -> SessionError {
        SessionError::Io {
            path: PathBuf::from("head.json"),
            source: std::io::Error::other("disk hiccup"),
        }
    }
}

#[async_trait]
impl SessionStore for FlakySessionStore {
    async fn save(&self, record: &SessionRecord) -> Result<SaveOutcome, SessionError> {
        let attempt = self.saves.fetch_add(1, Ordering::SeqCst) + 1;
        if (self.fail_save)(attempt) {
            return Err(Self::io_error());
        }
        self.inner.save(record).await
    }

    async fn load(&self, task_id: &str) -> Result<SessionRecord, SessionError> {
        if self.fail_loads {
            return Err(Self::io_error());
        }
        self.inner.load(task_id).await
    }

    async fn load_segment(&self, task_id: &str, index: u32) -> Result<SessionRecord, SessionError> {
        self.inner.load_segment(task_id, index).await
    }

    async fn exists(&self, task_id: &str) -> Result<bool, SessionError> {
        self.inner.exists(task_id).await
    }

    async fn archive(&self, task_id: &str) -> Result<(), SessionError> {
        self.inner.archive(task_id).await
    }
}

/// In-memory queue, temp-dir sessions and scripted collaborators wired into
/// a controller.
pub struct Harness {
    pub dir: TempDir,
    pub queue: WorkQueue,
    pub sessions: Arc<FileSessionStore>,
    pub escalation: Escalation,
    pub worker: Arc<ScriptedWorker>,
    pub verifier: Arc<ScriptedVerifier>,
    pub settings: ControllerSettings,
    pub controller: IterationController,
}

impl Harness {
    pub fn new(worker: ScriptedWorker, verifier: ScriptedVerifier, mode: EscalationMode) -> Self {
        let db = Database::new_in_memory().expect("in-memory database");
        Self::with_queue(
            WorkQueue::new(DbHandle::new(db), Duration::from_secs(60)),
            worker,
            verifier,
            mode,
        )
    }

    pub fn with_queue(
        queue: WorkQueue,
        worker: ScriptedWorker,
        verifier: ScriptedVerifier,
        mode: EscalationMode,
    ) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let sessions = Arc::new(FileSessionStore::new(dir.path().join("sessions"), 1 << 16, 2000));
        let escalation = Escalation::new(queue.clone(), sessions.clone(), Arc::new(NoopReverter), mode);
        let worker = Arc::new(worker);
        let verifier = Arc::new(verifier);
        let settings = ControllerSettings {
            infra_retries: 2,
            infra_backoff: Duration::from_millis(1),
            infra_backoff_max: Duration::from_millis(5),
            ..Default::default()
        };
        let controller = IterationController::new(
            queue.clone(),
            sessions.clone(),
            escalation.clone(),
            worker.clone(),
            verifier.clone(),
            settings.clone(),
        );
        Self {
            dir,
            queue,
            sessions,
            escalation,
            worker,
            verifier,
            settings,
            controller,
        }
    }

    /// Rebuild the controller over `store` instead of the plain file store.
    pub fn with_sessions(&mut self, store: Arc<dyn SessionStore>) {
        self.controller = IterationController::new(
            self.queue.clone(),
            store,
            self.escalation.clone(),
            self.worker.clone(),
            self.verifier.clone(),
            self.settings.clone(),
        );
    }

    /// Rebuild the controller after changing `settings`.
    pub fn rebuild(&mut self) {
        self.controller = IterationController::new(
            self.queue.clone(),
            self.sessions.clone(),
            self.escalation.clone(),
            self.worker.clone(),
            self.verifier.clone(),
            self.settings.clone(),
        );
    }
}
