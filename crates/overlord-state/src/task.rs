//! Task - one atomic, resumable step of a change

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::{ChangeId, TaskId};
use crate::payload::{self, Entries};
use crate::status::Status;

/// Number of log entries a task keeps; older entries are dropped.
pub const MAX_TASK_LOG: usize = 10;

const ERROR_MARK: &str = " ERROR ";

/// A single unit of work with a kind, a private payload and a status.
///
/// Tasks are owned by the [`crate::State`] and reached through a
/// [`crate::StateGuard`]. Edges to other tasks are managed by the guard so both
/// ends stay consistent.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Task {
    id: TaskId,
    kind: String,
    summary: String,
    status: Status,
    #[serde(default, skip_serializing_if = "Entries::is_empty")]
    data: Entries,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    wait_tasks: Vec<TaskId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    halt_tasks: Vec<TaskId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    lanes: Vec<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    change: Option<ChangeId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    log: Vec<String>,
    spawn_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ready_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    at_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "is_zero")]
    retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    progress: Option<Progress>,
    #[serde(default, skip_serializing_if = "is_false")]
    clean: bool,
}

/// Handler-reported progress of a running task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub label: String,
    pub done: u64,
    pub total: u64,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Task {
    pub(crate) fn new(id: TaskId, kind: &str, summary: &str) -> Self {
        Self {
            id,
            kind: kind.to_string(),
            summary: summary.to_string(),
            status: Status::Do,
            data: Entries::new(),
            wait_tasks: Vec::new(),
            halt_tasks: Vec::new(),
            lanes: Vec::new(),
            change: None,
            log: Vec::new(),
            spawn_time: Utc::now(),
            ready_time: None,
            at_time: None,
            retries: 0,
            progress: None,
            clean: false,
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// The owning change, once the task has been attached to one.
    pub fn change(&self) -> Option<&ChangeId> {
        self.change.as_ref()
    }

    /// Tasks that must complete before this one may run forward.
    pub fn wait_tasks(&self) -> &[TaskId] {
        &self.wait_tasks
    }

    /// Tasks that wait for this one.
    pub fn halt_tasks(&self) -> &[TaskId] {
        &self.halt_tasks
    }

    pub fn lanes(&self) -> &[u64] {
        &self.lanes
    }

    pub fn spawn_time(&self) -> DateTime<Utc> {
        self.spawn_time
    }

    pub fn ready_time(&self) -> Option<DateTime<Utc>> {
        self.ready_time
    }

    /// Earliest time the runner may start the task again.
    pub fn at_time(&self) -> Option<DateTime<Utc>> {
        self.at_time
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Current progress as `(label, done, total)`. Without reported progress
    /// a ready task reads as `1/1` and any other as `0/1`.
    pub fn progress(&self) -> (&str, u64, u64) {
        match &self.progress {
            Some(p) => (&p.label, p.done, p.total),
            None if self.status.is_ready() => ("", 1, 1),
            None => ("", 0, 1),
        }
    }

    /// Records progress. A zero total or `done` past `total` clears it, and
    /// cleared progress is not persisted.
    pub fn set_progress(&mut self, label: &str, done: u64, total: u64) {
        self.progress = (total > 0 && done <= total).then(|| Progress {
            label: label.to_string(),
            done,
            total,
        });
    }

    /// Whether the cleanup for this task has run (or was not needed).
    pub fn is_clean(&self) -> bool {
        self.clean
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        payload::get(&self.data, key)
    }

    pub fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<()> {
        payload::set(&mut self.data, key, value)
    }

    pub fn has(&self, key: &str) -> bool {
        payload::has(&self.data, key)
    }

    pub fn clear(&mut self, key: &str) {
        self.data.remove(key);
    }

    /// Sets the status without checking the state machine.
    ///
    /// Meant for administrative repair and test setup; the runner uses
    /// [`Task::transition`].
    pub fn set_status(&mut self, status: Status) {
        self.status = status;
        self.ready_time = status.is_ready().then(Utc::now);
    }

    /// Moves the task to `next`, refusing moves the state machine does not allow.
    pub fn transition(&mut self, next: Status) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::IllegalTransition {
                task: self.id.to_string(),
                from: self.status,
                to: next,
            });
        }
        self.set_status(next);
        Ok(())
    }

    pub fn join_lane(&mut self, lane: u64) {
        if !self.lanes.contains(&lane) {
            self.lanes.push(lane);
        }
    }

    pub fn set_at_time(&mut self, at: Option<DateTime<Utc>>) {
        self.at_time = at;
    }

    pub fn log(&self) -> &[String] {
        &self.log
    }

    pub fn logf(&mut self, message: impl AsRef<str>) {
        self.add_log("INFO", message.as_ref());
    }

    pub fn errorf(&mut self, message: impl AsRef<str>) {
        self.add_log("ERROR", message.as_ref());
    }

    /// Error messages recorded in the log, oldest first.
    pub fn errors(&self) -> impl Iterator<Item = &str> {
        self.log
            .iter()
            .filter_map(|line| line.find(ERROR_MARK).map(|i| &line[i + ERROR_MARK.len()..]))
    }

    fn add_log(&mut self, level: &str, message: &str) {
        if self.log.len() >= MAX_TASK_LOG {
            let excess = self.log.len() + 1 - MAX_TASK_LOG;
            self.log.drain(..excess);
        }
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        self.log.push(format!("{now} {level} {message}"));
    }

    pub(crate) fn bump_retries(&mut self) -> u32 {
        self.retries += 1;
        self.retries
    }

    pub(crate) fn reset_retries(&mut self) {
        self.retries = 0;
    }

    pub(crate) fn mark_clean(&mut self) {
        self.clean = true;
    }

    pub(crate) fn set_change(&mut self, change: ChangeId) {
        self.change = Some(change);
    }

    pub(crate) fn add_wait_task(&mut self, id: &TaskId) {
        if !self.wait_tasks.contains(id) {
            self.wait_tasks.push(id.clone());
        }
    }

    pub(crate) fn add_halt_task(&mut self, id: &TaskId) {
        if !self.halt_tasks.contains(id) {
            self.halt_tasks.push(id.clone());
        }
    }
}

/// An ordered group of tasks, typically the output of one subsystem call,
/// that can be wired and attached as a unit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskSet {
    tasks: Vec<TaskId>,
}

impl TaskSet {
    pub fn new(tasks: impl IntoIterator<Item = TaskId>) -> Self {
        let mut set = Self::default();
        for id in tasks {
            set.add_task(id);
        }
        set
    }

    pub fn add_task(&mut self, id: TaskId) {
        if !self.tasks.contains(&id) {
            self.tasks.push(id);
        }
    }

    pub fn add_all(&mut self, other: &TaskSet) {
        for id in &other.tasks {
            self.add_task(id.clone());
        }
    }

    pub fn tasks(&self) -> &[TaskId] {
        &self.tasks
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }
}

impl FromIterator<TaskId> for TaskSet {
    fn from_iter<I: IntoIterator<Item = TaskId>>(iter: I) -> Self {
        Self::new(iter)
    }
}
