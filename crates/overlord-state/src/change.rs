//! Change - a named DAG of tasks forming one logical operation

use std::collections::HashSet;
use std::ops::Deref;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::{self, TaskMap};
use crate::id::{ChangeId, TaskId};
use crate::payload::{self, Entries};
use crate::status::{Status, CHANGE_STATUS_PRECEDENCE};
use crate::task::{Task, TaskSet};

/// Lane number that selects tasks belonging to no lane.
pub const NO_LANE: u64 = 0;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Change {
    id: ChangeId,
    kind: String,
    summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<Status>,
    #[serde(default, skip_serializing_if = "Entries::is_empty")]
    data: Entries,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    task_ids: Vec<TaskId>,
    spawn_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ready_time: Option<DateTime<Utc>>,
}

impl Change {
    pub(crate) fn new(id: ChangeId, kind: &str, summary: &str) -> Self {
        Self {
            id,
            kind: kind.to_string(),
            summary: summary.to_string(),
            status: None,
            data: Entries::new(),
            task_ids: Vec::new(),
            spawn_time: Utc::now(),
            ready_time: None,
        }
    }

    pub fn id(&self) -> &ChangeId {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    /// Explicit status override, if one was set.
    pub fn status_override(&self) -> Option<Status> {
        self.status
    }

    /// Task ids in attachment order.
    pub fn task_ids(&self) -> &[TaskId] {
        &self.task_ids
    }

    pub fn spawn_time(&self) -> DateTime<Utc> {
        self.spawn_time
    }

    pub fn ready_time(&self) -> Option<DateTime<Utc>> {
        self.ready_time
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        payload::get(&self.data, key)
    }

    pub fn has(&self, key: &str) -> bool {
        payload::has(&self.data, key)
    }

    pub(crate) fn set_ready_time(&mut self, at: Option<DateTime<Utc>>) {
        self.ready_time = at;
    }
}

/// Folds task statuses into a change status; an empty change is on hold.
pub fn fold_status(statuses: impl IntoIterator<Item = Status>) -> Status {
    let present: HashSet<Status> = statuses.into_iter().collect();
    CHANGE_STATUS_PRECEDENCE
        .into_iter()
        .find(|s| present.contains(s))
        .unwrap_or(Status::Hold)
}

/// Read access to a change together with the tasks it owns.
#[derive(Clone, Copy)]
pub struct ChangeView<'a> {
    change: &'a Change,
    tasks: &'a TaskMap,
}

impl<'a> ChangeView<'a> {
    pub(crate) fn new(change: &'a Change, tasks: &'a TaskMap) -> Self {
        Self { change, tasks }
    }

    /// Status override if set, otherwise the fold of every task status.
    pub fn status(&self) -> Status {
        self.change
            .status
            .unwrap_or_else(|| fold_status(self.tasks().map(Task::status)))
    }

    pub fn is_ready(&self) -> bool {
        self.status().is_ready()
    }

    /// Whether every task has been cleaned up after the change became ready.
    pub fn is_clean(&self) -> bool {
        self.tasks().all(Task::is_clean)
    }

    /// Tasks in attachment order.
    pub fn tasks(&self) -> impl Iterator<Item = &'a Task> + 'a {
        let (change, tasks) = (self.change, self.tasks);
        change.task_ids.iter().filter_map(move |id| tasks.get(id))
    }

    /// Tasks in any of `lanes`; [`NO_LANE`] selects tasks that joined no lane.
    pub fn lane_tasks(&self, lanes: &[u64]) -> Vec<&'a Task> {
        self.tasks()
            .filter(|t| {
                if t.lanes().is_empty() {
                    lanes.contains(&NO_LANE)
                } else {
                    t.lanes().iter().any(|l| lanes.contains(l))
                }
            })
            .collect()
    }

    pub fn forward_order(&self) -> Vec<TaskId> {
        graph::forward_order(&self.change.task_ids, self.tasks)
    }

    pub fn reverse_order(&self) -> Vec<TaskId> {
        graph::reverse_order(&self.change.task_ids, self.tasks)
    }

    /// Summarizes task failures once the change is in Error; Ok otherwise.
    pub fn err(&self) -> Result<()> {
        if self.status() != Status::Error {
            return Ok(());
        }
        let failures: Vec<String> = self
            .tasks()
            .flat_map(|t| t.errors().map(move |msg| format!("{} ({msg})", t.summary())))
            .collect();
        if failures.is_empty() {
            return Err(Error::ChangeErrorUnlogged(self.change.kind.clone()));
        }
        Err(Error::ChangeFailed(failures.join("\n- ")))
    }
}

impl Deref for ChangeView<'_> {
    type Target = Change;

    fn deref(&self) -> &Change {
        self.change
    }
}

/// Write access to a change and the tasks it may touch.
pub struct ChangeMut<'a> {
    change: &'a mut Change,
    tasks: &'a mut TaskMap,
}

impl<'a> ChangeMut<'a> {
    pub(crate) fn new(change: &'a mut Change, tasks: &'a mut TaskMap) -> Self {
        Self { change, tasks }
    }

    pub fn view(&self) -> ChangeView<'_> {
        ChangeView::new(&*self.change, &*self.tasks)
    }

    pub fn status(&self) -> Status {
        self.view().status()
    }

    pub fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<()> {
        payload::set(&mut self.change.data, key, value)
    }

    pub fn clear(&mut self, key: &str) {
        self.change.data.remove(key);
    }

    /// Overrides the computed status; `None` goes back to the fold.
    pub fn set_status(&mut self, status: Option<Status>) {
        self.change.status = status;
    }

    /// Attaches a task. A task belongs to at most one change.
    pub fn add_task(&mut self, id: &TaskId) -> Result<()> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::NoSuchTask(id.to_string()))?;
        match task.change() {
            Some(owner) if owner == &self.change.id => return Ok(()),
            Some(_) => {
                return Err(Error::TaskAlreadyOwned {
                    kind: task.kind().to_string(),
                })
            }
            None => {}
        }
        task.set_change(self.change.id.clone());
        self.change.task_ids.push(id.clone());
        Ok(())
    }

    pub fn add_all(&mut self, set: &TaskSet) -> Result<()> {
        for id in set.tasks() {
            self.add_task(id)?;
        }
        Ok(())
    }

    /// Aborts every task: Do→Hold, Doing/Wait→Abort, Done→Undo.
    pub fn abort(&mut self) {
        for id in &self.change.task_ids {
            if let Some(task) = self.tasks.get_mut(id) {
                abort_task(task);
            }
        }
    }

    /// Aborts the tasks whose lanes are all in `lanes`, and whatever waits on them.
    ///
    /// Lanes of tasks pulled in through a dependency are aborted as well, so
    /// the abort spreads along lanes until nothing new is reached. [`NO_LANE`]
    /// selects tasks that joined no lane; an empty list aborts nothing.
    pub fn abort_lanes(&mut self, lanes: &[u64]) {
        let members: HashSet<TaskId> = self.change.task_ids.iter().cloned().collect();
        let mut aborted_lanes: HashSet<u64> = lanes.iter().copied().collect();
        let mut aborted: HashSet<TaskId> = HashSet::new();

        loop {
            let seeds: Vec<TaskId> = self
                .change
                .task_ids
                .iter()
                .filter(|id| !aborted.contains(*id))
                .filter(|id| {
                    self.tasks.get(*id).is_some_and(|t| {
                        if t.lanes().is_empty() {
                            aborted_lanes.contains(&NO_LANE)
                        } else {
                            t.lanes().iter().all(|l| aborted_lanes.contains(l))
                        }
                    })
                })
                .cloned()
                .collect();
            if seeds.is_empty() {
                break;
            }

            let mut stack = seeds;
            while let Some(id) = stack.pop() {
                if !members.contains(&id) || !aborted.insert(id.clone()) {
                    continue;
                }
                if let Some(task) = self.tasks.get_mut(&id) {
                    abort_task(task);
                    aborted_lanes.extend(task.lanes().iter().copied());
                    stack.extend(task.halt_tasks().iter().cloned());
                }
            }
        }
    }
}

impl Deref for ChangeMut<'_> {
    type Target = Change;

    fn deref(&self) -> &Change {
        self.change
    }
}

fn abort_task(task: &mut Task) {
    let next = match task.status() {
        Status::Do => Status::Hold,
        Status::Doing | Status::Wait => Status::Abort,
        Status::Done => Status::Undo,
        _ => return,
    };
    task.set_status(next);
}
