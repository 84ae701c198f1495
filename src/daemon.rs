//! Daemon wiring: open the overlord, run the ensure loop until shutdown

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use overlord_engine::{EngineConfig, Overlord, StateManager};
use tracing::info;

pub const STATE_ENV: &str = "OVERLORD_STATE";

/// Builds the effective config: the TOML file (defaults when absent), with the
/// state path replaced by `state` when given.
pub fn load_config(config: Option<&Path>, state: Option<PathBuf>) -> EngineConfig {
    let mut effective = match config {
        Some(path) => EngineConfig::load(path),
        None => EngineConfig::default(),
    };
    if let Some(state) = state {
        effective.state.path = state;
    }
    effective
}

pub struct Daemon {
    overlord: Overlord,
}

impl Daemon {
    /// Opens (or creates) the state file named by `config`.
    pub fn open(config: EngineConfig) -> anyhow::Result<Self> {
        let path = config.state.path.clone();
        let overlord =
            Overlord::new(config).with_context(|| format!("open state {}", path.display()))?;
        Ok(Self { overlord })
    }

    pub fn overlord(&self) -> &Overlord {
        &self.overlord
    }

    pub fn add_manager(&self, manager: Arc<dyn StateManager>) {
        self.overlord.add_manager(manager);
    }

    /// Starts the managers and the ensure loop, waits for `shutdown`, then
    /// stops everything.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        self.overlord.start_up().await.context("start up")?;
        self.overlord.start_loop()?;
        let kinds = self.overlord.task_runner().known_task_kinds();
        info!(
            "Daemon running: state {}, {} task kinds",
            self.overlord.config().state.path.display(),
            kinds.len()
        );

        shutdown.await;

        info!("Shutting down");
        self.overlord.stop().await;
        Ok(())
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
