//! Advisory conflict checks between changes
//!
//! The engine has no notion of what a resource is. Subsystems teach the
//! policy how to read claims off their tasks, either with a function per
//! task kind or with payload attributes holding a resource name (or a list
//! of them). Code about to create a change that touches a resource asks
//! [`check_change_conflict`] first.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use overlord_state::{ChangeId, StateGuard, Task};
use serde_json::Value;

use crate::error::{Error, Result};

/// State cache key the overlord stores the policy under.
pub const CONFLICT_POLICY_KEY: &str = "conflict-policy";

pub type ClaimFn = dyn Fn(&Task) -> Vec<String> + Send + Sync;

#[derive(Default)]
pub struct ConflictPolicy {
    kinds: RwLock<HashMap<String, Vec<Arc<ClaimFn>>>>,
    attrs: RwLock<Vec<String>>,
}

impl ConflictPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a function listing the resources claimed by tasks of `kind`.
    pub fn register_kind<F>(&self, kind: &str, claims: F)
    where
        F: Fn(&Task) -> Vec<String> + Send + Sync + 'static,
    {
        self.kinds
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind.to_string())
            .or_default()
            .push(Arc::new(claims));
    }

    /// Any task whose payload holds `attr` claims the resource(s) named there.
    pub fn register_attr(&self, attr: &str) {
        let mut attrs = self.attrs.write().unwrap_or_else(PoisonError::into_inner);
        if !attrs.iter().any(|a| a == attr) {
            attrs.push(attr.to_string());
        }
    }

    /// Resources claimed by one task, whatever its status.
    pub fn claims(&self, task: &Task) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(fns) = self
            .kinds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task.kind())
        {
            for f in fns {
                out.extend(f(task));
            }
        }
        for attr in self.attrs.read().unwrap_or_else(PoisonError::into_inner).iter() {
            match task.get::<Value>(attr) {
                Ok(Value::String(s)) => out.push(s),
                Ok(Value::Array(items)) => out.extend(
                    items
                        .into_iter()
                        .filter_map(|v| v.as_str().map(str::to_string)),
                ),
                _ => {}
            }
        }
        out.sort();
        out.dedup();
        out
    }

    /// Fails when a non-ready change other than `ignoring` has a non-ready
    /// task claiming `resource`.
    pub fn check(
        &self,
        st: &StateGuard<'_>,
        resource: &str,
        ignoring: Option<&ChangeId>,
    ) -> Result<()> {
        for change in st.changes() {
            if change.is_ready() || Some(change.id()) == ignoring {
                continue;
            }
            let claimed = change
                .tasks()
                .filter(|t| !t.status().is_ready())
                .any(|t| self.claims(t).iter().any(|r| r == resource));
            if claimed {
                return Err(Error::ChangeConflict {
                    resource: resource.to_string(),
                    change_kind: change.kind().to_string(),
                    change_id: change.id().clone(),
                });
            }
        }
        Ok(())
    }

    /// Every resource currently claimed, with the change claiming it.
    pub fn claimed_resources(&self, st: &StateGuard<'_>) -> BTreeMap<String, ChangeId> {
        let mut claimed = BTreeMap::new();
        for change in st.changes() {
            if change.is_ready() {
                continue;
            }
            for task in change.tasks().filter(|t| !t.status().is_ready()) {
                for resource in self.claims(task) {
                    claimed.entry(resource).or_insert_with(|| change.id().clone());
                }
            }
        }
        claimed
    }
}

/// Checks `resource` against the policy cached in the state. Without a cached
/// policy nothing is claimed.
pub fn check_change_conflict(
    st: &StateGuard<'_>,
    resource: &str,
    ignoring: Option<&ChangeId>,
) -> Result<()> {
    match st.cached::<ConflictPolicy>(CONFLICT_POLICY_KEY) {
        Some(policy) => policy.check(st, resource, ignoring),
        None => Ok(()),
    }
}

/// The policy cached in the state, if the overlord installed one.
pub fn conflict_policy(st: &StateGuard<'_>) -> Option<Arc<ConflictPolicy>> {
    st.cached::<ConflictPolicy>(CONFLICT_POLICY_KEY)
}
