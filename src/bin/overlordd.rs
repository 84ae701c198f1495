//! overlordd - durable change/task orchestration daemon
//!
//! Usage:
//!   overlordd [--config overlord.toml] [--state state.json]   → run until Ctrl-C/SIGTERM
//!   overlordd print-config                                    → effective config as TOML
//!   overlordd version                                         → show version

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use overlord::{init_tracing, load_config, shutdown_signal, Daemon, STATE_ENV};

#[derive(Parser)]
#[command(
    name = "overlordd",
    about = "Durable change/task orchestration daemon",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to config file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// State file (or set OVERLORD_STATE). Overrides [state] path.
    #[arg(short, long, global = true)]
    state: Option<PathBuf>,

    /// Write JSON logs to a file (in addition to stderr)
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon (default)
    Run,
    /// Print the effective config as TOML
    PrintConfig,
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let state = cli
        .state
        .clone()
        .or_else(|| std::env::var(STATE_ENV).ok().map(PathBuf::from));

    match cli.command {
        Some(Commands::Version) => {
            println!("overlordd v{}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::PrintConfig) => {
            print!("{}", load_config(cli.config.as_deref(), state).to_toml());
        }
        Some(Commands::Run) | None => {
            let _guard = init_tracing(cli.log_file.as_deref())?;
            let config = load_config(cli.config.as_deref(), state);
            let daemon = Daemon::open(config)?;
            daemon.run_until(shutdown_signal()).await?;
        }
    }

    Ok(())
}
