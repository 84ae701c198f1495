//! Tests for the overlord: state file lifecycle, managers, the ensure loop and settle

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use overlord_engine::{
    check_change_conflict, EngineConfig, Error, Overlord, Patches, StateManager, PATCH_LEVEL_KEY,
};
use overlord_state::{handler_fn, ChangeId, State, Status, TaskContext, TaskError, TaskId, TaskSet};

type Trace = Arc<Mutex<Vec<String>>>;

fn config_in(dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.state.path = dir.join("state.json");
    config.runner.stop_grace_ms = 500;
    config
}

struct Recorder {
    name: &'static str,
    trace: Trace,
    fail_start: bool,
    fail_ensure: bool,
}

impl Recorder {
    fn new(name: &'static str, trace: &Trace) -> Self {
        Self {
            name,
            trace: trace.clone(),
            fail_start: false,
            fail_ensure: false,
        }
    }

    fn push(&self, what: &str) {
        self.trace.lock().unwrap().push(format!("{what}:{}", self.name));
    }
}

#[async_trait::async_trait]
impl StateManager for Recorder {
    fn name(&self) -> &str {
        self.name
    }

    async fn start_up(&self) -> anyhow::Result<()> {
        self.push("start");
        if self.fail_start {
            anyhow::bail!("no disk");
        }
        Ok(())
    }

    async fn ensure(&self) -> anyhow::Result<()> {
        self.push("ensure");
        if self.fail_ensure {
            anyhow::bail!("broken");
        }
        Ok(())
    }

    async fn stop(&self) {
        self.push("stop");
    }
}

#[derive(Default)]
struct Counter(AtomicU32);

#[async_trait::async_trait]
impl StateManager for Counter {
    fn name(&self) -> &str {
        "counter"
    }

    async fn ensure(&self) -> anyhow::Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn new_change(st: &State, kinds: &[&str]) -> (ChangeId, Vec<TaskId>) {
    let mut g = st.lock();
    let chg = g.new_change("install", "Install something");
    let ids: Vec<TaskId> = kinds.iter().map(|k| g.new_task(k, &format!("Run {k}"))).collect();
    for pair in ids.windows(2) {
        g.wait_for(&pair[1], &pair[0]).unwrap();
    }
    g.change_mut(&chg)
        .unwrap()
        .add_all(&ids.iter().cloned().collect::<TaskSet>())
        .unwrap();
    (chg, ids)
}

fn status(st: &State, id: &TaskId) -> Status {
    st.lock().task(id).unwrap().status()
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

// ============================================================
// State file
// ============================================================

#[test]
fn fresh_state_is_written_at_current_patch_level() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let o = Overlord::with_patches(config.clone(), Patches::new(3)).unwrap();
    assert_eq!(o.state().lock().get::<u32>(PATCH_LEVEL_KEY).unwrap(), 3);

    let written = std::fs::read_to_string(&config.state.path).unwrap();
    assert!(written.contains("\"patch-level\":3"), "{written}");
}

#[test]
fn reopen_keeps_changes_and_id_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let first = {
        let o = Overlord::new(config_in(dir.path())).unwrap();
        let (chg, _) = new_change(o.state(), &["a", "b"]);
        chg
    };

    let o = Overlord::new(config_in(dir.path())).unwrap();
    let mut st = o.state().lock();
    let chg = st.change(&first).unwrap();
    assert_eq!(chg.kind(), "install");
    assert_eq!(chg.task_ids().len(), 2);
    let next = st.new_change("install", "Again");
    assert!(next > first);
}

#[test]
fn unreadable_state_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    std::fs::write(&config.state.path, "not json").unwrap();
    let err = Overlord::new(config).err().expect("corrupt state rejected");
    assert!(
        matches!(err, Error::State(overlord_state::Error::Corrupt(_))),
        "{err}"
    );
}

#[test]
fn existing_state_is_migrated_on_open() {
    let dir = tempfile::tempdir().unwrap();
    drop(Overlord::with_patches(config_in(dir.path()), Patches::new(1)).unwrap());

    let patches = Patches::new(2).add(2, |st| Ok(st.set("migrated", &true)?));
    let o = Overlord::with_patches(config_in(dir.path()), patches).unwrap();
    let st = o.state().lock();
    assert!(st.get::<bool>("migrated").unwrap());
    assert_eq!(st.get::<u32>(PATCH_LEVEL_KEY).unwrap(), 2);
}

#[test]
fn older_binary_refuses_newer_state() {
    let dir = tempfile::tempdir().unwrap();
    let patches = Patches::new(1).add(1, |_| Ok(()));
    drop(Overlord::with_patches(config_in(dir.path()), patches).unwrap());

    let err = Overlord::with_patches(config_in(dir.path()), Patches::new(0))
        .err()
        .expect("downgrade refused");
    assert_eq!(
        err.to_string(),
        "cannot downgrade: state patch level 1 is newer than supported level 0"
    );
}

// ============================================================
// State managers
// ============================================================

#[tokio::test]
async fn managers_start_in_registration_order() {
    let dir = tempfile::tempdir().unwrap();
    let o = Overlord::new(config_in(dir.path())).unwrap();
    let trace = Trace::default();
    o.add_manager(Arc::new(Recorder::new("a", &trace)));
    o.add_manager(Arc::new(Recorder::new("b", &trace)));

    o.start_up().await.unwrap();
    o.start_up().await.unwrap();
    assert_eq!(*trace.lock().unwrap(), vec!["start:a", "start:b"]);
}

#[tokio::test]
async fn failed_start_up_stops_there() {
    let dir = tempfile::tempdir().unwrap();
    let o = Overlord::new(config_in(dir.path())).unwrap();
    let trace = Trace::default();
    let mut broken = Recorder::new("b", &trace);
    broken.fail_start = true;
    o.add_manager(Arc::new(Recorder::new("a", &trace)));
    o.add_manager(Arc::new(broken));
    o.add_manager(Arc::new(Recorder::new("c", &trace)));

    let err = o.start_up().await.unwrap_err();
    assert_eq!(err.to_string(), "state manager b failed to start up: no disk");
    assert_eq!(*trace.lock().unwrap(), vec!["start:a", "start:b"]);
}

#[tokio::test]
async fn ensure_runs_every_manager_and_aggregates_errors() {
    let dir = tempfile::tempdir().unwrap();
    let o = Overlord::new(config_in(dir.path())).unwrap();
    let trace = Trace::default();
    let mut b = Recorder::new("b", &trace);
    b.fail_ensure = true;
    let mut c = Recorder::new("c", &trace);
    c.fail_ensure = true;
    o.add_manager(Arc::new(Recorder::new("a", &trace)));
    o.add_manager(Arc::new(b));
    o.add_manager(Arc::new(c));

    let err = o.state_engine().ensure().await.unwrap_err();
    assert_eq!(err.to_string(), "state ensure errors: [b: broken; c: broken]");
    assert_eq!(
        *trace.lock().unwrap(),
        vec!["ensure:a", "ensure:b", "ensure:c"]
    );
}

#[tokio::test]
async fn stop_runs_managers_in_reverse_order() {
    let dir = tempfile::tempdir().unwrap();
    let o = Overlord::new(config_in(dir.path())).unwrap();
    let trace = Trace::default();
    for name in ["a", "b", "c"] {
        o.add_manager(Arc::new(Recorder::new(name, &trace)));
    }

    o.stop().await;
    o.stop().await;
    assert_eq!(*trace.lock().unwrap(), vec!["stop:c", "stop:b", "stop:a"]);
    assert!(matches!(o.state_engine().ensure().await, Err(Error::Stopped)));
}

// ============================================================
// Settle
// ============================================================

#[tokio::test]
async fn settle_runs_change_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let o = Overlord::new(config_in(dir.path())).unwrap();
    for kind in ["download", "mount", "link"] {
        o.task_runner()
            .add_do_handler(kind, handler_fn(|ctx: TaskContext, _cancel| async move {
                ctx.set("ran", &true)?;
                Ok(())
            }))
            .unwrap();
    }
    let (chg, ids) = new_change(o.state(), &["download", "mount", "link"]);

    o.settle(Duration::from_secs(5)).await.unwrap();

    let st = o.state().lock();
    assert_eq!(st.change(&chg).unwrap().status(), Status::Done);
    for id in &ids {
        assert!(st.task(id).unwrap().get::<bool>("ran").unwrap());
    }
}

#[tokio::test]
async fn settle_rolls_back_failed_change() {
    let dir = tempfile::tempdir().unwrap();
    let o = Overlord::new(config_in(dir.path())).unwrap();
    let runner = o.task_runner();
    runner
        .add_handler(
            "a",
            handler_fn(|_ctx, _cancel| async { Ok(()) }),
            handler_fn(|_ctx, _cancel| async { Ok(()) }),
        )
        .unwrap();
    runner
        .add_do_handler("b", handler_fn(|_ctx, _cancel| async { Err(TaskError::failed("boom")) }))
        .unwrap();
    let (chg, ids) = new_change(o.state(), &["a", "b"]);

    o.settle(Duration::from_secs(5)).await.unwrap();

    assert_eq!(status(o.state(), &ids[0]), Status::Undone);
    assert_eq!(status(o.state(), &ids[1]), Status::Error);
    let st = o.state().lock();
    let change = st.change(&chg).unwrap();
    assert_eq!(change.status(), Status::Error);
    assert_eq!(
        change.err().unwrap_err().to_string(),
        "cannot perform the following tasks:\n- Run b (boom)"
    );
}

#[tokio::test]
async fn settle_reports_endless_retries() {
    let dir = tempfile::tempdir().unwrap();
    let o = Overlord::new(config_in(dir.path())).unwrap();
    o.task_runner()
        .add_do_handler("flaky", handler_fn(|_ctx, _cancel| async { Err(TaskError::retry("not yet")) }))
        .unwrap();
    let (_, ids) = new_change(o.state(), &["flaky"]);

    let err = o.settle(Duration::from_millis(300)).await.unwrap_err();
    assert!(matches!(err, Error::NotConverging), "{err}");
    assert!(o.state().lock().task(&ids[0]).unwrap().retries() > 0);
    o.stop().await;
}

#[tokio::test]
async fn settle_returns_ensure_errors() {
    let dir = tempfile::tempdir().unwrap();
    let o = Overlord::new(config_in(dir.path())).unwrap();
    let trace = Trace::default();
    let mut broken = Recorder::new("broken", &trace);
    broken.fail_ensure = true;
    o.add_manager(Arc::new(broken));

    let err = o.settle(Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(err, Error::Ensure(_)), "{err}");
}

// ============================================================
// Ensure loop
// ============================================================

#[tokio::test]
async fn loop_runs_at_start_and_on_request() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_in(dir.path());
    config.ensure.interval_ms = 60_000;
    let o = Overlord::new(config).unwrap();
    let counter = Arc::new(Counter::default());
    o.add_manager(counter.clone());

    o.start_loop().unwrap();
    wait_until("first pass", || counter.0.load(Ordering::SeqCst) >= 1).await;

    o.state().ensure_before(Duration::ZERO);
    wait_until("requested pass", || counter.0.load(Ordering::SeqCst) >= 2).await;

    assert!(matches!(o.start_loop(), Err(Error::LoopRunning)));
    assert!(matches!(
        o.settle(Duration::from_millis(10)).await,
        Err(Error::LoopRunning)
    ));
    o.stop().await;
}

#[tokio::test]
async fn loop_runs_again_after_interval() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_in(dir.path());
    config.ensure.interval_ms = 20;
    let o = Overlord::new(config).unwrap();
    let counter = Arc::new(Counter::default());
    o.add_manager(counter.clone());

    o.start_loop().unwrap();
    wait_until("three passes", || counter.0.load(Ordering::SeqCst) >= 3).await;
    o.stop().await;

    let after_stop = counter.0.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(counter.0.load(Ordering::SeqCst), after_stop);
}

#[tokio::test(start_paused = true)]
async fn loop_runs_once_per_interval_without_requests() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_in(dir.path());
    config.ensure.interval_ms = 1000;
    let interval = Duration::from_millis(1000);
    let o = Overlord::new(config).unwrap();
    let counter = Arc::new(Counter::default());
    o.add_manager(counter.clone());

    o.start_loop().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    for passes in 2..=5 {
        tokio::time::sleep(interval).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), passes);
    }
    o.stop().await;
}

#[tokio::test]
async fn loop_drives_change_to_ready() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_in(dir.path());
    config.ensure.interval_ms = 60_000;
    let o = Overlord::new(config).unwrap();
    for kind in ["a", "b"] {
        o.task_runner()
            .add_do_handler(kind, handler_fn(|_ctx, _cancel| async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(())
            }))
            .unwrap();
    }
    o.start_loop().unwrap();

    let (chg, _) = new_change(o.state(), &["a", "b"]);
    o.state().ensure_before(Duration::ZERO);
    let status = tokio::time::timeout(Duration::from_secs(5), o.state().wait_change_ready(&chg))
        .await
        .expect("change became ready")
        .unwrap();
    assert_eq!(status, Status::Done);
    o.stop().await;
}

// ============================================================
// Conflicts
// ============================================================

#[tokio::test]
async fn conflicts_last_while_change_is_in_progress() {
    let dir = tempfile::tempdir().unwrap();
    let o = Overlord::new(config_in(dir.path())).unwrap();
    o.conflict_policy().register_attr("snap-name");
    o.task_runner()
        .add_do_handler("download", handler_fn(|_ctx, _cancel| async { Ok(()) }))
        .unwrap();
    let (chg, ids) = new_change(o.state(), &["download"]);
    o.state()
        .lock()
        .task_mut(&ids[0])
        .unwrap()
        .set("snap-name", "core")
        .unwrap();

    {
        let st = o.state().lock();
        let err = check_change_conflict(&st, "core", None).unwrap_err();
        assert_eq!(err.to_string(), r#"resource "core" has "install" change in progress"#);
        assert!(check_change_conflict(&st, "core", Some(&chg)).is_ok());
        assert_eq!(
            o.conflict_policy().claimed_resources(&st).get("core"),
            Some(&chg)
        );
    }

    o.settle(Duration::from_secs(5)).await.unwrap();
    let st = o.state().lock();
    assert!(check_change_conflict(&st, "core", None).is_ok());
}
