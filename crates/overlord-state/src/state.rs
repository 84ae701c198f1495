//! State - the lock-guarded, durably checkpointed store every module shares
//!
//! All access goes through [`State::lock`], which hands out a [`StateGuard`].
//! Dropping a guard that modified anything serializes the whole state and
//! hands it to the [`Backend`] before the lock is released. Failing to
//! checkpoint is retried for a while and then aborts the process through the
//! state's fatal hook.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use crate::backend::Backend;
use crate::change::{Change, ChangeMut, ChangeView};
use crate::error::{Error, Result};
use crate::graph::{self, TaskMap};
use crate::id::{ChangeId, TaskId};
use crate::payload::{self, Entries};
use crate::status::Status;
use crate::task::{Task, TaskSet};

pub const DEFAULT_CHECKPOINT_RETRY_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_CHECKPOINT_RETRY_MAX: Duration = Duration::from_secs(5 * 60);

/// The persisted document.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct StateData {
    #[serde(default)]
    data: Entries,
    #[serde(default)]
    changes: BTreeMap<ChangeId, Change>,
    #[serde(default)]
    tasks: TaskMap,
    #[serde(default)]
    last_change_id: u64,
    #[serde(default)]
    last_task_id: u64,
    #[serde(default)]
    last_lane_id: u64,
}

impl StateData {
    /// Raises the id counters to at least the highest id present.
    fn repair_counters(&mut self) {
        let max_change = self.changes.keys().filter_map(ChangeId::number).max();
        let max_task = self.tasks.keys().filter_map(TaskId::number).max();
        let max_lane = self.tasks.values().flat_map(|t| t.lanes().iter().copied()).max();
        self.last_change_id = self.last_change_id.max(max_change.unwrap_or(0));
        self.last_task_id = self.last_task_id.max(max_task.unwrap_or(0));
        self.last_lane_id = self.last_lane_id.max(max_lane.unwrap_or(0));
    }

    fn refresh_ready_times(&mut self) {
        let StateData { changes, tasks, .. } = self;
        for change in changes.values_mut() {
            let ready = ChangeView::new(change, tasks).is_ready();
            match (ready, change.ready_time()) {
                (true, None) => change.set_ready_time(Some(Utc::now())),
                (false, Some(_)) => change.set_ready_time(None),
                _ => {}
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct CheckpointRetry {
    interval: Duration,
    max: Duration,
}

/// Called with the message once checkpointing has failed for longer than the
/// retry budget. The default aborts the process.
pub type FatalHook = Arc<dyn Fn(&str) + Send + Sync>;

fn abort_process(_msg: &str) {
    std::process::abort();
}

struct Inner {
    data: StateData,
    cache: HashMap<String, Arc<dyn Any + Send + Sync>>,
    modified: bool,
    retry: CheckpointRetry,
    fatal: FatalHook,
}

struct Shared {
    inner: Mutex<Inner>,
    backend: Option<Arc<dyn Backend>>,
    committed: Notify,
}

/// Handle to the shared state. Cloning is cheap and every clone sees the same store.
#[derive(Clone)]
pub struct State {
    shared: Arc<Shared>,
}

impl State {
    /// Creates an empty state. Without a backend nothing is persisted.
    pub fn new(backend: Option<Arc<dyn Backend>>) -> Self {
        Self::from_data(backend, StateData::default())
    }

    /// Rebuilds a state from a document produced by a previous checkpoint.
    pub fn read(backend: Option<Arc<dyn Backend>>, bytes: &[u8]) -> Result<Self> {
        let mut data: StateData = serde_json::from_slice(bytes).map_err(Error::Corrupt)?;
        data.repair_counters();
        debug!(
            "Read state: {} changes, {} tasks",
            data.changes.len(),
            data.tasks.len()
        );
        Ok(Self::from_data(backend, data))
    }

    fn from_data(backend: Option<Arc<dyn Backend>>, data: StateData) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    data,
                    cache: HashMap::new(),
                    modified: false,
                    retry: CheckpointRetry {
                        interval: DEFAULT_CHECKPOINT_RETRY_INTERVAL,
                        max: DEFAULT_CHECKPOINT_RETRY_MAX,
                    },
                    fatal: Arc::new(abort_process),
                }),
                backend,
                committed: Notify::new(),
            }),
        }
    }

    /// Sets how long a failing checkpoint is retried before giving up.
    pub fn with_checkpoint_retry(self, interval: Duration, max: Duration) -> Self {
        self.lock().guard.retry = CheckpointRetry { interval, max };
        self
    }

    /// Replaces what happens when checkpointing keeps failing. A hook that
    /// returns leaves the changes uncommitted; they are retried on the next
    /// modifying unlock.
    pub fn with_fatal_hook(self, hook: FatalHook) -> Self {
        self.lock().guard.fatal = hook;
        self
    }

    /// Acquires the state lock. The lock is not reentrant: locking again from
    /// the same task while a guard is alive deadlocks.
    pub fn lock(&self) -> StateGuard<'_> {
        // A handler panic caught by the runner may poison the mutex; the data
        // is still consistent because every commit happens in the guard's drop.
        let guard = self
            .shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        StateGuard {
            guard,
            shared: &self.shared,
        }
    }

    /// Asks the ensure loop to run within `d`. Does not take the lock.
    pub fn ensure_before(&self, d: Duration) {
        if let Some(backend) = &self.shared.backend {
            backend.ensure_before(d);
        }
    }

    /// Waits until the change is ready and returns its final status.
    pub async fn wait_change_ready(&self, id: &ChangeId) -> Result<Status> {
        loop {
            let committed = self.shared.committed.notified();
            tokio::pin!(committed);
            committed.as_mut().enable();
            {
                let st = self.lock();
                let change = st
                    .change(id)
                    .ok_or_else(|| Error::NoSuchChange(id.to_string()))?;
                if change.is_ready() {
                    return Ok(change.status());
                }
            }
            committed.await;
        }
    }
}

/// Exclusive access to the state; commits on drop.
pub struct StateGuard<'a> {
    guard: MutexGuard<'a, Inner>,
    shared: &'a Shared,
}

impl<'a> StateGuard<'a> {
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        payload::get(&self.guard.data.data, key)
    }

    /// Stores a top-level entry; `None`/`null` deletes it.
    pub fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<()> {
        payload::set(&mut self.guard.data.data, key, value)?;
        self.guard.modified = true;
        Ok(())
    }

    pub fn has(&self, key: &str) -> bool {
        payload::has(&self.guard.data.data, key)
    }

    /// Keeps a process-local object under `key`. Never persisted.
    pub fn cache<T: Any + Send + Sync>(&mut self, key: &str, value: Arc<T>) {
        self.guard.cache.insert(key.to_string(), value);
    }

    pub fn uncache(&mut self, key: &str) {
        self.guard.cache.remove(key);
    }

    /// The cached object under `key`, if there is one of type `T`.
    pub fn cached<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.guard.cache.get(key)?.clone();
        value.downcast::<T>().ok()
    }

    pub fn new_change(&mut self, kind: &str, summary: &str) -> ChangeId {
        let inner = &mut *self.guard;
        inner.data.last_change_id += 1;
        let id = ChangeId::from_counter(inner.data.last_change_id);
        inner
            .data
            .changes
            .insert(id.clone(), Change::new(id.clone(), kind, summary));
        inner.modified = true;
        id
    }

    /// Creates a task. It stays invisible to [`StateGuard::tasks`] and the
    /// runner until it is added to a change.
    pub fn new_task(&mut self, kind: &str, summary: &str) -> TaskId {
        let inner = &mut *self.guard;
        inner.data.last_task_id += 1;
        let id = TaskId::from_counter(inner.data.last_task_id);
        inner
            .data
            .tasks
            .insert(id.clone(), Task::new(id.clone(), kind, summary));
        inner.modified = true;
        id
    }

    /// Allocates a lane number. Lanes start at 1.
    pub fn new_lane(&mut self) -> u64 {
        let inner = &mut *self.guard;
        inner.data.last_lane_id += 1;
        inner.modified = true;
        inner.data.last_lane_id
    }

    pub fn changes(&self) -> Vec<ChangeView<'_>> {
        let data = &self.guard.data;
        data.changes
            .values()
            .map(|c| ChangeView::new(c, &data.tasks))
            .collect()
    }

    pub fn change(&self, id: &ChangeId) -> Option<ChangeView<'_>> {
        let data = &self.guard.data;
        data.changes.get(id).map(|c| ChangeView::new(c, &data.tasks))
    }

    pub fn change_mut(&mut self, id: &ChangeId) -> Option<ChangeMut<'_>> {
        let inner = &mut *self.guard;
        let StateData { changes, tasks, .. } = &mut inner.data;
        let change = changes.get_mut(id)?;
        inner.modified = true;
        Some(ChangeMut::new(change, tasks))
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.guard.data.tasks.get(id)
    }

    pub fn task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        let inner = &mut *self.guard;
        let task = inner.data.tasks.get_mut(id)?;
        inner.modified = true;
        Some(task)
    }

    /// Marks `task` as cleaned up. Only valid once its change is ready.
    pub fn set_clean(&mut self, task: &TaskId) -> Result<()> {
        if !self.task_change(task).is_some_and(|c| c.is_ready()) {
            return Err(Error::ChangeNotReady(task.to_string()));
        }
        if let Some(t) = self.task_mut(task) {
            t.mark_clean();
        }
        Ok(())
    }

    /// Tasks attached to some change, in id order.
    pub fn tasks(&self) -> Vec<&Task> {
        self.guard
            .data
            .tasks
            .values()
            .filter(|t| t.change().is_some())
            .collect()
    }

    /// The change owning `task`.
    pub fn task_change(&self, task: &TaskId) -> Option<ChangeView<'_>> {
        let change = self.task(task)?.change()?.clone();
        self.change(&change)
    }

    /// Makes `task` wait for `wait`. Edges that would close a cycle are refused.
    pub fn wait_for(&mut self, task: &TaskId, wait: &TaskId) -> Result<()> {
        let inner = &mut *self.guard;
        let tasks = &mut inner.data.tasks;
        for id in [task, wait] {
            if !tasks.contains_key(id) {
                return Err(Error::NoSuchTask(id.to_string()));
            }
        }
        if task == wait || graph::waits_for(tasks, wait, task) {
            return Err(Error::DependencyCycle {
                task: task.to_string(),
                wait: wait.to_string(),
            });
        }
        if let Some(t) = tasks.get_mut(task) {
            t.add_wait_task(wait);
        }
        if let Some(w) = tasks.get_mut(wait) {
            w.add_halt_task(task);
        }
        inner.modified = true;
        Ok(())
    }

    pub fn wait_all(&mut self, task: &TaskId, set: &TaskSet) -> Result<()> {
        for wait in set.tasks() {
            self.wait_for(task, wait)?;
        }
        Ok(())
    }

    /// Makes every task of `set` wait for `wait`.
    pub fn taskset_wait_for(&mut self, set: &TaskSet, wait: &TaskId) -> Result<()> {
        for task in set.tasks() {
            self.wait_for(task, wait)?;
        }
        Ok(())
    }

    /// Makes every task of `set` wait for every task of `other`.
    pub fn taskset_wait_all(&mut self, set: &TaskSet, other: &TaskSet) -> Result<()> {
        for task in set.tasks() {
            self.wait_all(task, other)?;
        }
        Ok(())
    }

    /// Moves a task parked in Wait back to Do and asks for an immediate ensure.
    pub fn resume(&mut self, id: &TaskId) -> Result<()> {
        let task = self
            .task_mut(id)
            .ok_or_else(|| Error::NoSuchTask(id.to_string()))?;
        task.transition(Status::Do)?;
        task.logf("resumed");
        self.ensure_before(Duration::ZERO);
        Ok(())
    }

    pub fn ensure_before(&self, d: Duration) {
        if let Some(backend) = &self.shared.backend {
            backend.ensure_before(d);
        }
    }

    /// Whether this guard will checkpoint when dropped.
    pub fn modified(&self) -> bool {
        self.guard.modified
    }

    /// Serializes the whole state as it would be checkpointed.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.guard.data).map_err(|source| Error::Marshal {
            key: "state".to_string(),
            source,
        })
    }

    /// Whether the state reached the backend.
    fn checkpoint(&self, backend: &dyn Backend) -> bool {
        let retry = self.guard.retry;
        let started = Instant::now();
        let err = loop {
            let result = serde_json::to_vec(&self.guard.data)
                .map_err(io::Error::from)
                .and_then(|bytes| backend.checkpoint(&bytes));
            match result {
                Ok(()) => return true,
                Err(e) if started.elapsed() >= retry.max => break e,
                Err(e) => {
                    warn!("Checkpoint failed, retrying in {:?}: {}", retry.interval, e);
                    std::thread::sleep(retry.interval);
                }
            }
        };
        let msg = format!(
            "cannot checkpoint even after {:?} of retries every {:?}: {}",
            retry.max, retry.interval, err
        );
        error!("{}", msg);
        (self.guard.fatal)(&msg);
        false
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        if !self.guard.modified {
            return;
        }
        self.guard.data.refresh_ready_times();
        if let Some(backend) = self.shared.backend.clone() {
            if !self.checkpoint(backend.as_ref()) {
                return;
            }
        }
        self.guard.modified = false;
        self.shared.committed.notify_waiters();
    }
}
