//! Run lifecycle: state machine, shared run state, report, and handle

use crate::effect::EffectKey;
use crate::env::EnvInner;
use crate::error::EngineError;
use crate::memo::FlightTable;
use crate::runner::cancel::CancelToken;
use crate::runner::commit::{commit_wave, CommitSummary};
use crate::runner::context::{FlightValue, FrameBuffer, ScopeContext};
use crate::scope::{MountTable, ScopeOutcome, ScopePath};
use crate::types::now_millis;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn new_run_id() -> String {
    let ts = now_millis();
    let pid = std::process::id();
    let seq = RUN_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("run-{ts}-{pid}-{seq}")
}

/// Run state machine: `Pending → Running → {Completed | Failed | Cancelled}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled
        )
    }

    pub fn can_transition_to(self, next: RunState) -> bool {
        matches!(
            (self, next),
            (RunState::Pending, RunState::Running)
                | (RunState::Pending, RunState::Cancelled)
                | (RunState::Running, RunState::Completed)
                | (RunState::Running, RunState::Failed)
                | (RunState::Running, RunState::Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scope that did not complete or commit, and why.
#[derive(Debug, Clone)]
pub struct ScopeFailure {
    pub path: ScopePath,
    pub error: EngineError,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Function bodies executed (mounts and calls).
    pub executed: usize,
    /// Invocations served from a memo entry.
    pub cache_hits: usize,
    /// Non-no-op actions applied, per provider.
    pub applied: BTreeMap<String, usize>,
    pub orphans_removed: Vec<ScopePath>,
    pub failures: Vec<ScopeFailure>,
}

impl RunReport {
    /// Completed with no scope failures.
    pub fn succeeded(&self) -> bool {
        self.state == RunState::Completed && self.failures.is_empty()
    }

    pub fn failure_at(&self, path: &ScopePath) -> Option<&EngineError> {
        self.failures
            .iter()
            .find(|f| &f.path == path)
            .map(|f| &f.error)
    }

    pub fn total_applied(&self) -> usize {
        self.applied.values().sum()
    }

    fn aborted(run_id: String, started_at: DateTime<Utc>, message: String) -> Self {
        Self {
            run_id,
            state: RunState::Failed,
            started_at,
            finished_at: Utc::now(),
            executed: 0,
            cache_hits: 0,
            applied: BTreeMap::new(),
            orphans_removed: Vec::new(),
            failures: vec![ScopeFailure {
                path: ScopePath::root(),
                error: EngineError::FunctionFailed {
                    path: ScopePath::root(),
                    function: "run".to_string(),
                    message,
                },
            }],
        }
    }
}

/// Counts spawned scope tasks so the runner can wait for quiescence.
#[derive(Default)]
pub(crate) struct TaskTracker {
    active: AtomicUsize,
    idle: Notify,
}

struct TaskGuard(Arc<TaskTracker>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if self.0.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl TaskTracker {
    pub fn spawn<F>(self: &Arc<Self>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.active.fetch_add(1, Ordering::SeqCst);
        let guard = TaskGuard(self.clone());
        tokio::spawn(async move {
            let _guard = guard;
            task.await;
        });
    }

    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// State shared by every scope of one run
pub(crate) struct RunShared {
    pub run_id: String,
    pub env: Arc<EnvInner>,
    pub mounts: MountTable,
    pub frames: Mutex<BTreeMap<ScopePath, FrameBuffer>>,
    pub flights: FlightTable<Result<FlightValue, EngineError>>,
    /// In-run producer of each declared effect key.
    pub owners: Mutex<HashMap<EffectKey, ScopePath>>,
    pub tasks: Arc<TaskTracker>,
    pub executed: AtomicUsize,
    pub cache_hits: AtomicUsize,
    pub failures: Mutex<Vec<ScopeFailure>>,
    pub fatal: Mutex<Option<EngineError>>,
    pub root_cancel: CancelToken,
    pub user_cancelled: AtomicBool,
    pub fail_fast_tripped: AtomicBool,
}

impl RunShared {
    pub fn new(env: Arc<EnvInner>) -> Self {
        Self {
            run_id: new_run_id(),
            env,
            mounts: MountTable::new(),
            frames: Mutex::new(BTreeMap::new()),
            flights: FlightTable::new(),
            owners: Mutex::new(HashMap::new()),
            tasks: Arc::new(TaskTracker::default()),
            executed: AtomicUsize::new(0),
            cache_hits: AtomicUsize::new(0),
            failures: Mutex::new(Vec::new()),
            fatal: Mutex::new(None),
            root_cancel: CancelToken::new(),
            user_cancelled: AtomicBool::new(false),
            fail_fast_tripped: AtomicBool::new(false),
        }
    }

    /// Record a scope failure raised while bodies are running.
    pub fn record_failure(&self, path: &ScopePath, err: &EngineError) {
        if err.is_cancelled() {
            return;
        }
        if err.is_fatal() {
            error!(run_id = %self.run_id, path = %path, error = %err, "Fatal storage error, stopping run");
            self.fatal.lock().get_or_insert_with(|| err.clone());
            self.root_cancel.cancel();
        } else {
            warn!(run_id = %self.run_id, path = %path, error = %err, "Scope failed");
        }
        self.failures.lock().push(ScopeFailure {
            path: path.clone(),
            error: err.clone(),
        });
        if self.env.config.runner.fail_fast && !self.fail_fast_tripped.swap(true, Ordering::SeqCst) {
            info!(run_id = %self.run_id, "fail_fast set, cancelling remaining work");
            self.root_cancel.cancel();
        }
    }

    /// Record a failure discovered during the commit wave.
    pub fn record_commit_failure(&self, path: &ScopePath, err: EngineError) {
        warn!(run_id = %self.run_id, path = %path, error = %err, "Scope not committed");
        self.failures.lock().push(ScopeFailure {
            path: path.clone(),
            error: err,
        });
    }

    fn is_fatal(&self) -> bool {
        self.fatal.lock().is_some()
    }
}

/// Handle to a run started with [`Environment::start`](crate::env::Environment::start).
pub struct RunHandle {
    run: Arc<RunShared>,
    started_at: DateTime<Utc>,
    join: JoinHandle<RunReport>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run.run_id
    }

    /// Cancel all in-flight work. The run finishes as `Cancelled` and
    /// commits nothing.
    pub fn cancel(&self) {
        if !self.run.user_cancelled.swap(true, Ordering::SeqCst) {
            info!(run_id = %self.run.run_id, "Run cancellation requested");
        }
        self.run.root_cancel.cancel();
    }

    pub async fn wait(self) -> RunReport {
        match self.join.await {
            Ok(report) => report,
            Err(err) => {
                error!(run_id = %self.run.run_id, error = %err, "Run task aborted");
                RunReport::aborted(self.run.run_id.clone(), self.started_at, err.to_string())
            }
        }
    }
}

/// Spawn a run driving `root` at the root scope.
pub(crate) fn start<F, Fut>(env: Arc<EnvInner>, root: F) -> RunHandle
where
    F: FnOnce(ScopeContext) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let run = Arc::new(RunShared::new(env));
    let started_at = Utc::now();
    let join = tokio::spawn(drive(run.clone(), started_at, root));
    RunHandle {
        run,
        started_at,
        join,
    }
}

async fn drive<F, Fut>(run: Arc<RunShared>, started_at: DateTime<Utc>, root: F) -> RunReport
where
    F: FnOnce(ScopeContext) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let mut state = RunState::Pending;
    transition(&run, &mut state, RunState::Running);
    info!(run_id = %run.run_id, "Run started");

    let root_path = ScopePath::root();
    let ctx = ScopeContext::root(run.clone());
    let outcome = tokio::select! {
        biased;
        _ = run.root_cancel.cancelled() => Err(EngineError::Cancelled(root_path.clone())),
        result = root(ctx.clone()) => result.map_err(|e| ctx.body_error("root", e)),
    };
    match outcome {
        Ok(()) => run.mounts.set_outcome(&root_path, ScopeOutcome::Executed),
        Err(err) => {
            let o = if err.is_cancelled() {
                ScopeOutcome::Cancelled
            } else {
                ScopeOutcome::Failed
            };
            run.mounts.set_outcome(&root_path, o);
            run.record_failure(&root_path, &err);
            run.root_cancel.cancel();
        }
    }

    run.tasks.wait_idle().await;

    let mut summary = CommitSummary::default();
    let next = if run.user_cancelled.load(Ordering::SeqCst) {
        info!(run_id = %run.run_id, "Run cancelled, skipping commit wave");
        RunState::Cancelled
    } else if run.is_fatal() {
        RunState::Failed
    } else {
        match commit_wave(&run).await {
            Ok(s) => {
                summary = s;
                if run.fail_fast_tripped.load(Ordering::SeqCst) {
                    RunState::Failed
                } else {
                    RunState::Completed
                }
            }
            Err(err) => {
                error!(run_id = %run.run_id, error = %err, "Commit wave aborted");
                run.record_commit_failure(&root_path, err);
                RunState::Failed
            }
        }
    };
    transition(&run, &mut state, next);

    let report = RunReport {
        run_id: run.run_id.clone(),
        state,
        started_at,
        finished_at: Utc::now(),
        executed: run.executed.load(Ordering::SeqCst),
        cache_hits: run.cache_hits.load(Ordering::SeqCst),
        applied: summary.applied,
        orphans_removed: summary.orphans_removed,
        failures: std::mem::take(&mut *run.failures.lock()),
    };
    info!(
        run_id = %report.run_id,
        state = %report.state,
        executed = report.executed,
        cache_hits = report.cache_hits,
        applied = report.total_applied(),
        orphans_removed = report.orphans_removed.len(),
        failures = report.failures.len(),
        "Run finished"
    );
    report
}

fn transition(run: &RunShared, state: &mut RunState, next: RunState) {
    debug_assert!(state.can_transition_to(next), "{} -> {}", state, next);
    tracing::debug!(run_id = %run.run_id, from = %state, to = %next, "Run state transition");
    *state = next;
}
