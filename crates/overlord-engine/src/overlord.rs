//! The overlord: owns the state, the task runner and the ensure loop

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use overlord_state::persist::read_if_exists;
use overlord_state::{Backend, CancellationToken, State, TaskRunner};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::OverlordBackend;
use crate::config::EngineConfig;
use crate::conflict::{ConflictPolicy, CONFLICT_POLICY_KEY};
use crate::ensure::{deadline_after, EnsureTimer};
use crate::error::{Error, Result};
use crate::manager::{StateEngine, StateManager};
use crate::patch::Patches;

struct LoopHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Overlord {
    config: EngineConfig,
    state: State,
    runner: TaskRunner,
    engine: Arc<StateEngine>,
    timer: Arc<EnsureTimer>,
    policy: Arc<ConflictPolicy>,
    ensure_loop: Mutex<Option<LoopHandle>>,
}

impl Overlord {
    /// Opens (or creates) the state file named by `config` with no state patches.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_patches(config, Patches::default())
    }

    /// Opens the state file and migrates it with `patches`. A missing file
    /// starts a fresh state at the current patch level; an unreadable one is
    /// an error.
    pub fn with_patches(config: EngineConfig, patches: Patches) -> Result<Self> {
        let path = config.state.path.clone();
        let timer = Arc::new(EnsureTimer::new());
        let backend: Arc<dyn Backend> = Arc::new(OverlordBackend::new(&path, timer.clone()));

        let existing = read_if_exists(&path).map_err(|source| Error::ReadState {
            path: path.clone(),
            source,
        })?;
        let state = match &existing {
            Some(bytes) => State::read(Some(backend), bytes)?,
            None => State::new(Some(backend)),
        }
        .with_checkpoint_retry(config.checkpoint_retry_interval(), config.checkpoint_retry_max());

        match existing {
            Some(_) => patches.apply(&state)?,
            None => {
                info!("No state at {}, starting fresh", path.display());
                patches.init(&state)?;
            }
        }

        let policy = Arc::new(ConflictPolicy::new());
        state.lock().cache(CONFLICT_POLICY_KEY, policy.clone());

        let runner = TaskRunner::new(state.clone(), config.runner_config());
        let engine = Arc::new(StateEngine::new(state.clone(), runner.clone()));
        info!(
            "Overlord ready: state {} at patch level {}",
            path.display(),
            patches.level()
        );

        Ok(Self {
            config,
            state,
            runner,
            engine,
            timer,
            policy,
            ensure_loop: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn task_runner(&self) -> &TaskRunner {
        &self.runner
    }

    pub fn state_engine(&self) -> &StateEngine {
        &self.engine
    }

    pub fn conflict_policy(&self) -> &ConflictPolicy {
        &self.policy
    }

    /// Adds a manager after the ones already registered.
    pub fn add_manager(&self, manager: Arc<dyn StateManager>) {
        self.engine.add_manager(manager);
    }

    pub async fn start_up(&self) -> Result<()> {
        self.engine.start_up().await
    }

    fn ensure_loop(&self) -> std::sync::MutexGuard<'_, Option<LoopHandle>> {
        self.ensure_loop.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns the ensure loop. Passes run right away, then whenever an
    /// ensure is requested and at least once per configured interval.
    pub fn start_loop(&self) -> Result<()> {
        let mut slot = self.ensure_loop();
        if slot.is_some() {
            return Err(Error::LoopRunning);
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_ensure_loop(
            self.engine.clone(),
            self.timer.clone(),
            self.config.ensure_interval(),
            cancel.clone(),
        ));
        *slot = Some(LoopHandle { cancel, handle });
        Ok(())
    }

    /// Stops the ensure loop, then the state engine (runner first, then the
    /// managers in reverse order).
    pub async fn stop(&self) {
        let running = self.ensure_loop().take();
        if let Some(LoopHandle { cancel, handle }) = running {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!("Ensure loop ended abnormally: {}", e);
            }
        }
        self.engine.stop().await;
    }

    /// Runs ensure passes, waiting for the runner after each, until a pass
    /// leaves no further ensure requested. Must not be used while the ensure
    /// loop runs. Returns the error of the last pass, if any.
    pub async fn settle(&self, timeout: Duration) -> Result<()> {
        if self.ensure_loop().is_some() {
            return Err(Error::LoopRunning);
        }
        let deadline = deadline_after(timeout);
        self.timer.ensure_before(Duration::ZERO);
        let mut last = Ok(());
        loop {
            let Some(next) = self.timer.requested() else {
                return last;
            };
            if next > deadline || Instant::now() >= deadline {
                return Err(Error::NotConverging);
            }
            tokio::time::sleep_until(next).await;
            self.timer.take();
            last = self.engine.ensure().await;
            if tokio::time::timeout_at(deadline, self.runner.wait())
                .await
                .is_err()
            {
                return Err(Error::NotConverging);
            }
        }
    }
}

async fn run_ensure_loop(
    engine: Arc<StateEngine>,
    timer: Arc<EnsureTimer>,
    interval: Duration,
    cancel: CancellationToken,
) {
    info!("Ensure loop started (interval {:?})", interval);
    let mut next = Instant::now();
    loop {
        let deadline = timer.next_deadline(next);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(deadline) => {}
            _ = timer.changed() => continue,
        }
        timer.take();
        next = deadline_after(interval);
        debug!("Ensure pass");
        match engine.ensure().await {
            Ok(()) => {}
            Err(Error::Stopped) => break,
            Err(e) => warn!("{}", e),
        }
    }
    info!("Ensure loop stopped");
}
