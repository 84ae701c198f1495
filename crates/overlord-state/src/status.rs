//! Task and change status values

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Status of a task, or the computed status of a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Queued to run forward.
    Do,
    /// Forward handler running (or to be re-invoked).
    Doing,
    /// Forward handler completed.
    Done,
    /// Rollback requested while the task was in flight.
    Abort,
    /// Queued to run backward.
    Undo,
    /// Backward handler running.
    Undoing,
    /// Rollback completed.
    Undone,
    /// Blocked; the runner will not touch it again.
    Hold,
    /// A handler failed terminally.
    Error,
    /// Parked until resumed by something outside the runner.
    Wait,
}

/// Order in which task statuses win when folding them into a change status.
/// The first status present among a change's tasks is the change status.
pub const CHANGE_STATUS_PRECEDENCE: [Status; 10] = [
    Status::Abort,
    Status::Undoing,
    Status::Undo,
    Status::Doing,
    Status::Do,
    Status::Wait,
    Status::Error,
    Status::Hold,
    Status::Undone,
    Status::Done,
];

impl Status {
    pub const ALL: [Status; 10] = [
        Status::Do,
        Status::Doing,
        Status::Done,
        Status::Abort,
        Status::Undo,
        Status::Undoing,
        Status::Undone,
        Status::Hold,
        Status::Error,
        Status::Wait,
    ];

    /// Whether no further progress is expected without outside intervention.
    pub fn is_ready(self) -> bool {
        matches!(
            self,
            Status::Done | Status::Undone | Status::Error | Status::Hold
        )
    }

    /// Whether the runner may move a task from `self` to `next`.
    pub fn can_transition_to(self, next: Status) -> bool {
        use Status::{Abort, Do, Doing, Done, Error, Hold, Undo, Undoing, Undone, Wait};
        match self {
            Do => matches!(next, Doing | Hold | Abort),
            Doing => matches!(next, Doing | Done | Error | Wait | Abort),
            Done => matches!(next, Undo),
            Abort => matches!(next, Undo | Undone | Hold | Error),
            // Undo -> Done: the kind has nothing to revert.
            Undo => matches!(next, Undoing | Done),
            Undoing => matches!(next, Undoing | Undone | Error),
            Wait => matches!(next, Do | Hold | Abort),
            Hold => matches!(next, Abort),
            Undone | Error => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Do => "Do",
            Status::Doing => "Doing",
            Status::Done => "Done",
            Status::Abort => "Abort",
            Status::Undo => "Undo",
            Status::Undoing => "Undoing",
            Status::Undone => "Undone",
            Status::Hold => "Hold",
            Status::Error => "Error",
            Status::Wait => "Wait",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .iter()
            .copied()
            .find(|st| st.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown status {s:?}"))
    }
}
