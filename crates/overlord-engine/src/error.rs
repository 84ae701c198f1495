//! Engine error types

use std::path::PathBuf;

use overlord_state::ChangeId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    State(#[from] overlord_state::Error),

    #[error("cannot read state file {path}: {source}")]
    ReadState {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Another non-ready change already claims the resource.
    #[error("resource {resource:?} has {change_kind:?} change in progress")]
    ChangeConflict {
        resource: String,
        change_kind: String,
        change_id: ChangeId,
    },

    #[error("cannot downgrade: state patch level {stored} is newer than supported level {supported}")]
    PatchDowngrade { stored: u32, supported: u32 },

    #[error("cannot migrate from state patch level {from} to {to}: no supported migration")]
    MissingPatch { from: u32, to: u32 },

    #[error("cannot migrate from state patch level {from} to {to}: {source}")]
    PatchFailed {
        from: u32,
        to: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("state manager {name} failed to start up: {source}")]
    StartUp {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("state ensure errors: [{}]", .0.join("; "))]
    Ensure(Vec<String>),

    #[error("state engine already stopped")]
    Stopped,

    #[error("ensure loop already running")]
    LoopRunning,

    #[error("settle is not converging")]
    NotConverging,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ChangeConflict { .. })
    }
}
