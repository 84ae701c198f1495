//! Checkpointing backend used by the overlord

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use overlord_state::persist::atomic_write;
use overlord_state::Backend;

use crate::ensure::EnsureTimer;

/// Writes each committed state to the state file and forwards wake-up
/// requests to the ensure timer.
pub struct OverlordBackend {
    path: PathBuf,
    timer: Arc<EnsureTimer>,
}

impl OverlordBackend {
    pub fn new(path: impl Into<PathBuf>, timer: Arc<EnsureTimer>) -> Self {
        Self { path: path.into(), timer }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Backend for OverlordBackend {
    fn checkpoint(&self, data: &[u8]) -> io::Result<()> {
        atomic_write(&self.path, data)
    }

    fn ensure_before(&self, d: Duration) {
        self.timer.ensure_before(d);
    }
}
