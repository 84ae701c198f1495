//! Overlord daemon - process bootstrap around the orchestration engine

pub mod daemon;
pub mod logging;

pub use daemon::{load_config, shutdown_signal, Daemon, STATE_ENV};
pub use logging::{init_tracing, DEFAULT_FILTER};
