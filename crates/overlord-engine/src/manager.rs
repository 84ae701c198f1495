//! State managers and the engine that drives them

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use overlord_state::{State, TaskRunner};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// A subsystem driven by the ensure loop.
///
/// `ensure` is called on every pass and should return quickly: slow work
/// belongs in tasks, not inline here, since one slow manager delays the
/// whole loop.
#[async_trait::async_trait]
pub trait StateManager: Send + Sync {
    /// Name used in logs and aggregated errors.
    fn name(&self) -> &str;

    /// Called once, in registration order, before the first ensure pass.
    async fn start_up(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Reconciles the subsystem with the state.
    async fn ensure(&self) -> anyhow::Result<()>;

    /// Called once on shutdown, in reverse registration order.
    async fn stop(&self) {}
}

/// Runs the registered managers and then the task runner.
pub struct StateEngine {
    state: State,
    runner: TaskRunner,
    managers: Mutex<Vec<Arc<dyn StateManager>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl StateEngine {
    pub fn new(state: State, runner: TaskRunner) -> Self {
        Self {
            state,
            runner,
            managers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.runner
    }

    pub fn add_manager(&self, manager: Arc<dyn StateManager>) {
        debug!("Registered state manager {}", manager.name());
        self.managers().push(manager);
    }

    fn managers(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn StateManager>>> {
        self.managers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> Vec<Arc<dyn StateManager>> {
        self.managers().clone()
    }

    /// Starts every manager in registration order, stopping at the first failure.
    /// Later calls do nothing.
    pub async fn start_up(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for manager in self.snapshot() {
            manager.start_up().await.map_err(|source| Error::StartUp {
                name: manager.name().to_string(),
                source,
            })?;
        }
        info!("State engine started");
        Ok(())
    }

    /// One reconciliation pass: every manager, even when some fail, then the runner.
    pub async fn ensure(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::Stopped);
        }
        let mut errors = Vec::new();
        for manager in self.snapshot() {
            if let Err(e) = manager.ensure().await {
                warn!("State manager {} ensure failed: {:#}", manager.name(), e);
                errors.push(format!("{}: {:#}", manager.name(), e));
            }
        }
        self.runner.ensure();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Ensure(errors))
        }
    }

    /// Stops the runner, then the managers in reverse order. Later calls do nothing.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.runner.stop().await;
        for manager in self.snapshot().iter().rev() {
            manager.stop().await;
        }
        info!("State engine stopped");
    }
}
