//! Error types for the state store and task runner

use std::time::Duration;

use thiserror::Error;

use crate::status::Status;

#[derive(Error, Debug)]
pub enum Error {
    /// The entry is absent (or persisted as `null`). Callers branch on this.
    #[error("no state entry for key")]
    NoState,

    #[error("could not marshal value for state entry {key:?}: {source}")]
    Marshal {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("could not unmarshal state entry {key:?}: {source}")]
    Unmarshal {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("no change with id {0:?}")]
    NoSuchChange(String),

    #[error("no task with id {0:?}")]
    NoSuchTask(String),

    #[error("cannot add one {kind:?} task to multiple changes")]
    TaskAlreadyOwned { kind: String },

    #[error("task {task:?} cannot wait for {wait:?}: dependency cycle")]
    DependencyCycle { task: String, wait: String },

    #[error("task {task:?} cannot move from {from} to {to}")]
    IllegalTransition { task: String, from: Status, to: Status },

    #[error("cannot clean task {0:?} while its change is not ready")]
    ChangeNotReady(String),

    #[error("handler for task kind {0:?} already registered")]
    DuplicateHandler(String),

    #[error("cannot perform the following tasks:\n- {0}")]
    ChangeFailed(String),

    #[error("internal inconsistency: change {0:?} in Error with no task errors logged")]
    ChangeErrorUnlogged(String),

    #[error("cannot read state: {0}")]
    Corrupt(#[source] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True when the entry is absent or does not have the requested shape.
    /// [`Error::Unmarshal`] still carries the decoding detail for logs.
    pub fn is_no_state(&self) -> bool {
        matches!(self, Self::NoState | Self::Unmarshal { .. })
    }
}

/// Outcome of a task handler other than success.
///
/// An `anyhow::Error` or a state [`Error`] propagated with `?` inside a handler
/// becomes [`TaskError::Failed`], which is terminal and starts the undo cascade
/// for the change.
#[derive(Error, Debug)]
pub enum TaskError {
    /// Transient condition: leave the task re-runnable, optionally not before `after`.
    #[error("task should be retried: {reason}")]
    Retry { after: Duration, reason: String },

    /// Park the task until something external resumes it.
    #[error("task is waiting: {reason}")]
    Wait { reason: String },

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl TaskError {
    pub fn retry(reason: impl Into<String>) -> Self {
        Self::Retry {
            after: Duration::ZERO,
            reason: reason.into(),
        }
    }

    pub fn retry_after(after: Duration, reason: impl Into<String>) -> Self {
        Self::Retry {
            after,
            reason: reason.into(),
        }
    }

    pub fn wait(reason: impl Into<String>) -> Self {
        Self::Wait {
            reason: reason.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(anyhow::anyhow!(message.into()))
    }
}

impl From<Error> for TaskError {
    fn from(err: Error) -> Self {
        Self::Failed(anyhow::Error::new(err))
    }
}
