//! Engine configuration
//!
//! Loaded from TOML at startup; every section falls back to defaults when a
//! key or the whole file is missing.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use overlord_state::RunnerConfig;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Where and how the state is persisted.
    pub state: StateConfig,
    /// Ensure loop cadence.
    pub ensure: EnsureConfig,
    /// Task runner limits.
    pub runner: RunnerSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// State document path. Written atomically on every commit.
    pub path: PathBuf,
    /// Delay between attempts when a checkpoint fails.
    pub checkpoint_retry_interval_ms: u64,
    /// Give up (and abort the process) after failing this long.
    pub checkpoint_retry_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsureConfig {
    /// Longest gap between two ensure passes.
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSection {
    /// Grace period for cancelled handlers on stop.
    pub stop_grace_ms: u64,
    /// Retries per task before it is forced to Error. Unset is unbounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_limit: Option<u32>,
}

// ============================================================
// Defaults
// ============================================================

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state: StateConfig::default(),
            ensure: EnsureConfig::default(),
            runner: RunnerSection::default(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("state.json"),
            checkpoint_retry_interval_ms: 3_000,
            checkpoint_retry_max_ms: 300_000,
        }
    }
}

impl Default for EnsureConfig {
    fn default() -> Self {
        Self { interval_ms: 300_000 }
    }
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self { stop_grace_ms: 5_000, retry_limit: None }
    }
}

// ============================================================
// Loading
// ============================================================

impl EngineConfig {
    /// Load config from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}, using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!("No config at {}, using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Render the config as TOML (for generating a default config file).
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    pub fn ensure_interval(&self) -> Duration {
        Duration::from_millis(self.ensure.interval_ms)
    }

    pub fn checkpoint_retry_interval(&self) -> Duration {
        Duration::from_millis(self.state.checkpoint_retry_interval_ms)
    }

    pub fn checkpoint_retry_max(&self) -> Duration {
        Duration::from_millis(self.state.checkpoint_retry_max_ms)
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            retry_limit: self.runner.retry_limit,
            stop_grace: Duration::from_millis(self.runner.stop_grace_ms),
        }
    }
}
