//! TaskRunner - drives tasks through their do/undo handlers
//!
//! Each [`TaskRunner::ensure`] pass scans every linked task, starts the ones
//! whose dependencies allow it, and returns. Handlers run as spawned tokio
//! tasks with their own [`CancellationToken`]; when one returns, the runner
//! takes the state lock and moves the task on, aborting the rest of the
//! change when a forward handler fails.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{Error, Result, TaskError};
use crate::id::{ChangeId, TaskId};
use crate::state::{State, StateGuard};
use crate::status::Status;
use crate::task::Task;

/// What a handler sees of its task. Payload accessors take the state lock
/// for the duration of the call only, and commit before returning.
#[derive(Clone)]
pub struct TaskContext {
    state: State,
    id: TaskId,
    kind: String,
    change: Option<ChangeId>,
}

impl TaskContext {
    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn change_id(&self) -> Option<&ChangeId> {
        self.change.as_ref()
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let st = self.state.lock();
        self.task(&st)?.get(key)
    }

    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let mut st = self.state.lock();
        self.task_mut(&mut st)?.set(key, value)
    }

    /// Reports how far the handler got; see [`Task::set_progress`].
    pub fn set_progress(&self, label: &str, done: u64, total: u64) -> Result<()> {
        let mut st = self.state.lock();
        self.task_mut(&mut st)?.set_progress(label, done, total);
        Ok(())
    }

    pub fn logf(&self, message: impl AsRef<str>) -> Result<()> {
        let mut st = self.state.lock();
        self.task_mut(&mut st)?.logf(message);
        Ok(())
    }

    fn task<'g>(&self, st: &'g StateGuard<'_>) -> Result<&'g Task> {
        st.task(&self.id)
            .ok_or_else(|| Error::NoSuchTask(self.id.to_string()))
    }

    fn task_mut<'g>(&self, st: &'g mut StateGuard<'_>) -> Result<&'g mut Task> {
        st.task_mut(&self.id)
            .ok_or_else(|| Error::NoSuchTask(self.id.to_string()))
    }
}

/// Forward or backward logic for one task kind.
///
/// Returning `Ok` completes the step. Handlers must be safe to re-run from the
/// last committed payload: after a restart the runner invokes them again.
/// A handler interrupted through its cancel token should return
/// [`TaskError::Retry`]; the runner then undoes or re-runs the task as its
/// status requires.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn run(&self, task: TaskContext, cancel: CancellationToken) -> std::result::Result<(), TaskError>;
}

/// Adapts an async closure into a [`Handler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(TaskContext, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), TaskError>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(TaskContext, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), TaskError>> + Send + 'static,
{
    async fn run(&self, task: TaskContext, cancel: CancellationToken) -> std::result::Result<(), TaskError> {
        (self.0)(task, cancel).await
    }
}

type BlockedFn = dyn Fn(&Task, &[&Task]) -> bool + Send + Sync;
type MatchFn = dyn Fn(&Task) -> bool + Send + Sync;

#[derive(Clone)]
struct HandlerPair {
    forward: Arc<dyn Handler>,
    backward: Option<Arc<dyn Handler>>,
}

/// Fallback handlers for tasks whose kind has none registered.
#[derive(Clone)]
struct OptionalHandler {
    matcher: Arc<MatchFn>,
    pair: HandlerPair,
}

/// Which handler slot a spawned run came from.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Step {
    Run,
    Cleanup,
}

#[derive(Clone, Debug)]
pub struct RunnerConfig {
    /// Retries allowed per task before it is forced to Error. `None` is unbounded.
    pub retry_limit: Option<u32>,
    /// How long [`TaskRunner::stop`] waits for cancelled handlers.
    pub stop_grace: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            retry_limit: None,
            stop_grace: Duration::from_secs(5),
        }
    }
}

struct Inner {
    state: State,
    config: RunnerConfig,
    handlers: RwLock<HashMap<String, HandlerPair>>,
    optional: RwLock<Vec<OptionalHandler>>,
    cleanups: RwLock<HashMap<String, Arc<dyn Handler>>>,
    blocked: RwLock<Vec<Arc<BlockedFn>>>,
    running: DashMap<TaskId, CancellationToken>,
    tracker: TaskTracker,
    stopped: AtomicBool,
}

#[derive(Clone)]
pub struct TaskRunner {
    inner: Arc<Inner>,
}

impl TaskRunner {
    pub fn new(state: State, config: RunnerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state,
                config,
                handlers: RwLock::new(HashMap::new()),
                optional: RwLock::new(Vec::new()),
                cleanups: RwLock::new(HashMap::new()),
                blocked: RwLock::new(Vec::new()),
                running: DashMap::new(),
                tracker: TaskTracker::new(),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn state(&self) -> &State {
        &self.inner.state
    }

    /// Registers the forward and backward handlers of `kind`.
    pub fn add_handler(
        &self,
        kind: &str,
        forward: impl Handler + 'static,
        backward: impl Handler + 'static,
    ) -> Result<()> {
        self.register(kind, Arc::new(forward), Some(Arc::new(backward)))
    }

    /// Registers a kind whose effect needs no reverting.
    pub fn add_do_handler(&self, kind: &str, forward: impl Handler + 'static) -> Result<()> {
        self.register(kind, Arc::new(forward), None)
    }

    fn register(
        &self,
        kind: &str,
        forward: Arc<dyn Handler>,
        backward: Option<Arc<dyn Handler>>,
    ) -> Result<()> {
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(kind) {
            return Err(Error::DuplicateHandler(kind.to_string()));
        }
        handlers.insert(kind.to_string(), HandlerPair { forward, backward });
        debug!("Registered handlers for task kind {}", kind);
        Ok(())
    }

    /// Registers handlers for tasks of unregistered kinds accepted by
    /// `matcher`. The first matching registration wins.
    pub fn add_optional_handler<M>(
        &self,
        matcher: M,
        forward: impl Handler + 'static,
        backward: Option<Arc<dyn Handler>>,
    ) where
        M: Fn(&Task) -> bool + Send + Sync + 'static,
    {
        self.inner
            .optional
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(OptionalHandler {
                matcher: Arc::new(matcher),
                pair: HandlerPair {
                    forward: Arc::new(forward),
                    backward,
                },
            });
    }

    /// Registers a handler run once for each `kind` task after its change
    /// becomes ready. A failing cleanup is retried on a later pass.
    pub fn add_cleanup(&self, kind: &str, cleanup: impl Handler + 'static) {
        self.inner
            .cleanups
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind.to_string(), Arc::new(cleanup));
    }

    /// Adds a predicate consulted before starting any task. It receives the
    /// candidate and the tasks currently running; returning true defers the
    /// candidate to a later pass.
    pub fn add_blocked<F>(&self, pred: F)
    where
        F: Fn(&Task, &[&Task]) -> bool + Send + Sync + 'static,
    {
        self.inner
            .blocked
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(pred));
    }

    pub fn known_task_kinds(&self) -> Vec<String> {
        let handlers = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut kinds: Vec<String> = handlers.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn running_count(&self) -> usize {
        self.inner.running.len()
    }

    /// One scheduling pass. Must be called from within a tokio runtime and
    /// without holding the state lock.
    pub fn ensure(&self) {
        if self.inner.stopped.load(Ordering::Acquire) {
            return;
        }
        let handlers = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let optional = self
            .inner
            .optional
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let cleanups = self
            .inner
            .cleanups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let blocked = self
            .inner
            .blocked
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut st = self.inner.state.lock();
        let now = Utc::now();
        let mut next_wake: Option<DateTime<Utc>> = None;

        let mut running: Vec<Task> = self
            .inner
            .running
            .iter()
            .filter_map(|entry| st.task(entry.key()).cloned())
            .collect();
        let candidates: Vec<Task> = st.tasks().into_iter().cloned().collect();

        for task in candidates {
            let id = task.id().clone();
            let Some(pair) = lookup(&handlers, &optional, &task) else {
                continue;
            };

            if let Some(token) = self.inner.running.get(&id) {
                if task.status() == Status::Abort {
                    token.cancel();
                }
                continue;
            }

            if st.task_change(&id).is_some_and(|c| c.is_ready()) {
                if task.is_clean() {
                    continue;
                }
                match cleanups.get(task.kind()) {
                    Some(cleanup) => self.spawn(task, cleanup.clone(), Step::Cleanup),
                    None => {
                        if let Err(e) = st.set_clean(&id) {
                            warn!("{}", e);
                        }
                    }
                }
                continue;
            }

            let status = task.status();
            match status {
                Status::Abort => {
                    if let Some(t) = st.task_mut(&id) {
                        if try_undo(t, pair.backward.is_some()) {
                            st.ensure_before(Duration::ZERO);
                        }
                    }
                    continue;
                }
                Status::Do | Status::Doing | Status::Undo | Status::Undoing => {}
                _ => continue,
            }

            if let Some(at) = task.at_time() {
                if at > now {
                    next_wake = Some(next_wake.map_or(at, |w| w.min(at)));
                    continue;
                }
            }

            if must_wait(&st, &task) {
                continue;
            }

            if status == Status::Undo && pair.backward.is_none() {
                // Nothing to revert.
                if let Some(t) = st.task_mut(&id) {
                    move_task(t, Status::Done);
                }
                if !task.wait_tasks().is_empty() {
                    st.ensure_before(Duration::ZERO);
                }
                continue;
            }

            {
                let others: Vec<&Task> = running.iter().collect();
                if blocked.iter().any(|pred| pred(&task, others.as_slice())) {
                    debug!(task = %id, kind = %task.kind(), "Task blocked");
                    continue;
                }
            }

            let (next, handler) = match status {
                Status::Do | Status::Doing => (Status::Doing, pair.forward.clone()),
                _ => match &pair.backward {
                    Some(backward) => (Status::Undoing, backward.clone()),
                    None => continue,
                },
            };
            let Some(t) = st.task_mut(&id) else {
                continue;
            };
            move_task(t, next);
            t.set_at_time(None);
            let started = t.clone();
            self.spawn(started.clone(), handler, Step::Run);
            running.push(started);
        }

        if let Some(at) = next_wake {
            st.ensure_before((at - now).to_std().unwrap_or(Duration::ZERO));
        }
    }

    fn spawn(&self, task: Task, handler: Arc<dyn Handler>, step: Step) {
        let id = task.id().clone();
        let token = CancellationToken::new();
        self.inner.running.insert(id.clone(), token.clone());
        match step {
            Step::Run => info!(task = %id, kind = %task.kind(), status = %task.status(), "Running task"),
            Step::Cleanup => debug!(task = %id, kind = %task.kind(), "Cleaning up task"),
        }

        let ctx = TaskContext {
            state: self.inner.state.clone(),
            id: id.clone(),
            kind: task.kind().to_string(),
            change: task.change().cloned(),
        };
        let runner = self.clone();
        self.inner.tracker.spawn(async move {
            let outcome = match AssertUnwindSafe(handler.run(ctx, token)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(panic) => Err(TaskError::failed(format!(
                    "handler panicked: {}",
                    panic_message(panic.as_ref())
                ))),
            };
            match step {
                Step::Run => runner.finish(&id, outcome),
                Step::Cleanup => runner.finish_cleanup(&id, outcome),
            }
        });
    }

    fn finish_cleanup(&self, id: &TaskId, outcome: std::result::Result<(), TaskError>) {
        let mut st = self.inner.state.lock();
        self.inner.running.remove(id);
        match outcome {
            Ok(()) => {
                if let Err(e) = st.set_clean(id) {
                    warn!("{}", e);
                }
            }
            Err(e) => debug!(task = %id, "Cleanup failed, will retry: {}", e),
        }
    }

    fn finish(&self, id: &TaskId, outcome: std::result::Result<(), TaskError>) {
        let mut st = self.inner.state.lock();
        self.inner.running.remove(id);

        let Some(task) = st.task(id) else {
            return;
        };
        let status = task.status();
        let has_backward = {
            let handlers = self
                .inner
                .handlers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            let optional = self
                .inner
                .optional
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            lookup(&handlers, &optional, task).is_some_and(|pair| pair.backward.is_some())
        };

        match outcome {
            Ok(()) => {
                let next = match status {
                    Status::Doing => Status::Done,
                    // The handler finished anyway; revert its effect.
                    Status::Abort => Status::Undo,
                    Status::Undoing => Status::Undone,
                    other => {
                        warn!(task = %id, status = %other, "Handler returned for task in unexpected status");
                        return;
                    }
                };
                if let Some(t) = st.task_mut(id) {
                    move_task(t, next);
                    t.reset_retries();
                }
                debug!(task = %id, status = %next, "Task finished");
                st.ensure_before(Duration::ZERO);
            }
            Err(TaskError::Retry { after, reason }) => {
                self.retry(&mut st, id, status, has_backward, after, reason);
            }
            Err(TaskError::Wait { reason }) => match status {
                Status::Doing => {
                    if let Some(t) = st.task_mut(id) {
                        move_task(t, Status::Wait);
                        t.logf(format!("waiting: {reason}"));
                    }
                    info!(task = %id, "Task waiting: {}", reason);
                }
                // Undo cannot park; try again later.
                _ => self.retry(&mut st, id, status, has_backward, Duration::ZERO, reason),
            },
            Err(TaskError::Failed(err)) => {
                fail(&mut st, id, status, &format!("{err:#}"));
            }
        }
    }

    fn retry(
        &self,
        st: &mut StateGuard<'_>,
        id: &TaskId,
        status: Status,
        has_backward: bool,
        after: Duration,
        reason: String,
    ) {
        if status == Status::Abort {
            if let Some(t) = st.task_mut(id) {
                if try_undo(t, has_backward) {
                    st.ensure_before(Duration::ZERO);
                }
            }
            return;
        }
        let Some(t) = st.task_mut(id) else {
            return;
        };
        let retries = t.bump_retries();
        if let Some(limit) = self.inner.config.retry_limit {
            if retries > limit {
                let msg = format!("giving up after {limit} retries: {reason}");
                fail(st, id, status, &msg);
                return;
            }
        }
        if !reason.is_empty() {
            t.logf(format!("will retry: {reason}"));
        }
        if after.is_zero() {
            t.set_at_time(None);
        } else {
            let at = chrono::Duration::from_std(after)
                .ok()
                .and_then(|d| Utc::now().checked_add_signed(d));
            t.set_at_time(at);
        }
        debug!(task = %id, retries, "Task will be retried in {:?}", after);
        st.ensure_before(after);
    }

    /// Waits for every running handler to return.
    pub async fn wait(&self) {
        let tracker = &self.inner.tracker;
        tracker.close();
        tracker.wait().await;
        // stop() closed the tracker for good.
        if !self.inner.stopped.load(Ordering::Acquire) {
            tracker.reopen();
        }
    }

    /// Cancels every running handler and waits, bounded by the stop grace
    /// period, for them to return. No tasks are started afterwards.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        for entry in self.inner.running.iter() {
            entry.value().cancel();
        }
        let tracker = &self.inner.tracker;
        tracker.close();
        let grace = self.inner.config.stop_grace;
        if tokio::time::timeout(grace, tracker.wait()).await.is_err() {
            warn!(
                "{} task handlers still running after {:?}",
                self.inner.running.len(),
                grace
            );
        }
    }
}

/// Handlers registered for the task's kind, else the first matching optional ones.
fn lookup<'h>(
    handlers: &'h HashMap<String, HandlerPair>,
    optional: &'h [OptionalHandler],
    task: &Task,
) -> Option<&'h HandlerPair> {
    handlers.get(task.kind()).or_else(|| {
        optional
            .iter()
            .find(|o| (o.matcher)(task))
            .map(|o| &o.pair)
    })
}

/// Whether `task` has to wait for other tasks before it may run.
fn must_wait(st: &StateGuard<'_>, task: &Task) -> bool {
    match task.status() {
        Status::Do | Status::Doing => task
            .wait_tasks()
            .iter()
            .filter_map(|id| st.task(id))
            .any(|w| w.status() != Status::Done),
        Status::Undo | Status::Undoing => task
            .halt_tasks()
            .iter()
            .filter_map(|id| st.task(id))
            .any(|h| !h.status().is_ready()),
        _ => false,
    }
}

/// Moves an aborted task on: to Undo when its kind can be reverted, to Hold
/// otherwise. Returns whether another pass is needed.
fn try_undo(task: &mut Task, has_backward: bool) -> bool {
    if task.status() != Status::Abort {
        return false;
    }
    if has_backward {
        move_task(task, Status::Undo);
        true
    } else {
        move_task(task, Status::Hold);
        false
    }
}

fn fail(st: &mut StateGuard<'_>, id: &TaskId, status: Status, message: &str) {
    warn!(task = %id, "Task failed: {}", message);
    let Some(task) = st.task_mut(id) else {
        return;
    };
    task.errorf(message);

    if status != Status::Undoing {
        let change = task.change().cloned();
        let lanes = task.lanes().to_vec();
        if let Some(change) = change {
            if let Some(mut chg) = st.change_mut(&change) {
                if lanes.is_empty() {
                    chg.abort();
                } else {
                    chg.abort_lanes(&lanes);
                }
            }
        }
    }
    if let Some(task) = st.task_mut(id) {
        move_task(task, Status::Error);
    }
    st.ensure_before(Duration::ZERO);
}

fn move_task(task: &mut Task, next: Status) {
    if let Err(e) = task.transition(next) {
        warn!("{}", e);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
