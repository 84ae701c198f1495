//! Daemon wiring tests: config resolution and a full run against a temp state file

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use overlord::{load_config, Daemon};
use overlord_engine::{EngineConfig, StateManager, PATCH_LEVEL_KEY};
use overlord_state::{handler_fn, State, Status};

#[derive(Default)]
struct Passes(AtomicU32);

#[async_trait::async_trait]
impl StateManager for Passes {
    fn name(&self) -> &str {
        "passes"
    }

    async fn ensure(&self) -> anyhow::Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================
// Config
// ============================================================

#[test]
fn state_flag_overrides_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("overlord.toml");
    std::fs::write(
        &config_path,
        "[state]\npath = \"/var/lib/overlord/state.json\"\n\n[ensure]\ninterval_ms = 1000\n",
    )
    .unwrap();

    let from_file = load_config(Some(&config_path), None);
    assert_eq!(
        from_file.state.path,
        std::path::PathBuf::from("/var/lib/overlord/state.json")
    );

    let overridden = load_config(Some(&config_path), Some(dir.path().join("other.json")));
    assert_eq!(overridden.state.path, dir.path().join("other.json"));
    assert_eq!(overridden.ensure.interval_ms, 1000);
}

#[test]
fn missing_config_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_config(Some(&dir.path().join("absent.toml")), None);
    assert_eq!(config.ensure.interval_ms, EngineConfig::default().ensure.interval_ms);
}

// ============================================================
// Running
// ============================================================

#[tokio::test]
async fn daemon_runs_changes_and_persists_them() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");
    let mut config = load_config(None, Some(state_path.clone()));
    config.ensure.interval_ms = 60_000;

    let daemon = Daemon::open(config).unwrap();
    let passes = Arc::new(Passes::default());
    daemon.add_manager(passes.clone());
    let overlord = daemon.overlord();
    overlord
        .task_runner()
        .add_do_handler(
            "greet",
            handler_fn(|ctx, _cancel| async move {
                ctx.set("greeting", "hello")?;
                Ok(())
            }),
        )
        .unwrap();
    let state = overlord.state().clone();
    let chg = {
        let mut st = state.lock();
        let chg = st.new_change("greet", "Say hello");
        let t = st.new_task("greet", "Greet");
        st.change_mut(&chg).unwrap().add_task(&t).unwrap();
        chg
    };

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let run = tokio::spawn(daemon.run_until(async {
        let _ = stop_rx.await;
    }));

    let status = tokio::time::timeout(Duration::from_secs(5), state.wait_change_ready(&chg))
        .await
        .expect("change became ready")
        .unwrap();
    assert_eq!(status, Status::Done);
    assert!(passes.0.load(Ordering::SeqCst) >= 1);

    stop_tx.send(()).unwrap();
    run.await.unwrap().unwrap();

    let restored = State::read(None, &std::fs::read(&state_path).unwrap()).unwrap();
    let st = restored.lock();
    assert_eq!(st.change(&chg).unwrap().status(), Status::Done);
    let binding = st.change(&chg).unwrap();
    let task = &binding.task_ids()[0];
    assert_eq!(st.task(task).unwrap().get::<String>("greeting").unwrap(), "hello");
    assert_eq!(st.get::<u32>(PATCH_LEVEL_KEY).unwrap(), 0);
}

#[test]
fn corrupt_state_file_fails_to_open() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");
    std::fs::write(&state_path, "{").unwrap();
    let err = Daemon::open(load_config(None, Some(state_path.clone())))
        .err()
        .expect("open fails");
    assert!(err.to_string().starts_with("open state"), "{err:#}");
}
