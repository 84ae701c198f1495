//! Overlord State - durable change/task store and the task runner
//!
//! A [`State`] holds named entries plus every [`Change`] and [`Task`], and
//! checkpoints itself whenever a modifying [`StateGuard`] is dropped. The
//! [`TaskRunner`] executes tasks through per-kind handlers, rolling a change
//! back with undo handlers when one of its tasks fails.

pub mod backend;
pub mod change;
pub mod error;
mod graph;
pub mod id;
mod payload;
pub mod persist;
pub mod runner;
pub mod state;
pub mod status;
pub mod task;

pub use backend::Backend;
pub use change::{fold_status, Change, ChangeMut, ChangeView, NO_LANE};
pub use error::{Error, Result, TaskError};
pub use id::{ChangeId, TaskId};
pub use runner::{handler_fn, FnHandler, Handler, RunnerConfig, TaskContext, TaskRunner};
pub use state::{FatalHook, State, StateGuard};
pub use status::{Status, CHANGE_STATUS_PRECEDENCE};
pub use task::{Progress, Task, TaskSet, MAX_TASK_LOG};

/// Re-exported so handler implementations need not depend on tokio-util directly.
pub use tokio_util::sync::CancellationToken;
