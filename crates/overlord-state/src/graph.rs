//! Traversal of the task dependency graph of one change

use std::collections::{BTreeMap, HashSet};

use crate::id::TaskId;
use crate::task::Task;

pub(crate) type TaskMap = BTreeMap<TaskId, Task>;

/// Topological order of `ids`: every task comes after the tasks it waits for.
///
/// Edges to tasks outside `ids` are ignored. Among tasks that are free at the
/// same time the one attached first wins, so the order is deterministic.
pub(crate) fn forward_order(ids: &[TaskId], tasks: &TaskMap) -> Vec<TaskId> {
    let members: HashSet<&TaskId> = ids.iter().collect();
    let mut emitted: HashSet<&TaskId> = HashSet::with_capacity(ids.len());
    let mut order = Vec::with_capacity(ids.len());

    while order.len() < ids.len() {
        let next = ids.iter().find(|id| {
            !emitted.contains(id)
                && tasks.get(*id).map_or(true, |t| {
                    t.wait_tasks()
                        .iter()
                        .all(|w| !members.contains(w) || emitted.contains(w))
                })
        });
        match next {
            Some(id) => {
                emitted.insert(id);
                order.push(id.clone());
            }
            // Only reachable with a cycle, which wait_for refuses to create.
            None => {
                order.extend(ids.iter().filter(|id| !emitted.contains(id)).cloned());
                break;
            }
        }
    }
    order
}

/// Order in which an undo cascade walks `ids`: dependents before the tasks they waited for.
pub(crate) fn reverse_order(ids: &[TaskId], tasks: &TaskMap) -> Vec<TaskId> {
    let mut order = forward_order(ids, tasks);
    order.reverse();
    order
}

/// Whether `from` waits, directly or transitively, for `target`.
pub(crate) fn waits_for(tasks: &TaskMap, from: &TaskId, target: &TaskId) -> bool {
    let mut stack = vec![from];
    let mut seen = HashSet::new();
    while let Some(id) = stack.pop() {
        if id == target {
            return true;
        }
        if !seen.insert(id) {
            continue;
        }
        if let Some(task) = tasks.get(id) {
            stack.extend(task.wait_tasks());
        }
    }
    false
}
