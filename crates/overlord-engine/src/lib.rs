//! Overlord Engine - drives state managers and the task runner
//!
//! The [`Overlord`] opens the persisted [`State`](overlord_state::State),
//! migrates it to the current patch level and runs the ensure loop: every
//! registered [`StateManager`] reconciles, then the task runner starts
//! whatever tasks became runnable.

pub mod backend;
pub mod config;
pub mod conflict;
pub mod ensure;
pub mod error;
pub mod manager;
pub mod overlord;
pub mod patch;

pub use backend::OverlordBackend;
pub use config::{EngineConfig, EnsureConfig, RunnerSection, StateConfig};
pub use conflict::{check_change_conflict, conflict_policy, ConflictPolicy, CONFLICT_POLICY_KEY};
pub use ensure::EnsureTimer;
pub use error::{Error, Result};
pub use manager::{StateEngine, StateManager};
pub use overlord::Overlord;
pub use patch::{Patches, PATCH_LEVEL_KEY};
