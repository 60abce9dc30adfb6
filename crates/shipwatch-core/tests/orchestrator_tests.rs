use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use shipwatch_core::{
    notify::Notifier,
    orchestrator::{Collaborators, DeployOrchestrator},
    resolver::HeadResolver,
    shell::TaskRunner,
    supervisor::Supervisor,
    CommitId, CycleOutcome, CycleState, DeployError, DeployResult, LaunchSpec,
    RepositoryReference,
};
use tokio::sync::Notify;

// ── helpers ──────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<String>>>);

impl Recorder {
    fn push(&self, s: impl Into<String>) {
        self.0.lock().unwrap().push(s.into());
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

struct MockResolver {
    head: Mutex<Option<String>>,
    calls: AtomicUsize,
}

#[async_trait]
impl HeadResolver for MockResolver {
    async fn resolve_head(&self, _repo: &RepositoryReference) -> DeployResult<CommitId> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.head.lock().unwrap().clone() {
            Some(h) => Ok(CommitId::new(h)),
            None => Err(DeployError::Network("connection refused".into())),
        }
    }
}

struct MockTasks {
    rec: Recorder,
    fail_sync: AtomicBool,
    fail_install: AtomicBool,
    /// When set, sync announces itself on `entered` and blocks until `release`.
    gate: Option<(Arc<Notify>, Arc<Notify>)>,
}

#[async_trait]
impl TaskRunner for MockTasks {
    async fn sync(&self) -> DeployResult<()> {
        self.rec.push("sync");
        if let Some((entered, release)) = &self.gate {
            entered.notify_one();
            release.notified().await;
        }
        if self.fail_sync.load(Ordering::SeqCst) {
            return Err(shell_error("git pull"));
        }
        Ok(())
    }

    async fn install(&self) -> DeployResult<()> {
        self.rec.push("install");
        if self.fail_install.load(Ordering::SeqCst) {
            return Err(shell_error("npm install"));
        }
        Ok(())
    }
}

fn shell_error(command: &str) -> DeployError {
    DeployError::ShellCommand {
        command: command.into(),
        exit_code: 1,
        output: "boom".into(),
    }
}

struct MockSupervisor {
    rec: Recorder,
    running: AtomicBool,
    fail_start: AtomicBool,
    fail_stop: AtomicBool,
}

#[async_trait]
impl Supervisor for MockSupervisor {
    async fn start(&self, launch: &LaunchSpec) -> DeployResult<()> {
        self.rec.push("start");
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(DeployError::ProcessSpawn {
                command: launch.display(),
                reason: "No such file or directory".into(),
            });
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> DeployResult<()> {
        self.rec.push("stop");
        if self.fail_stop.load(Ordering::SeqCst) {
            // The old process is still there
            return Err(DeployError::StopTimeout {
                pid: 4242,
                waited: Duration::from_secs(15),
            });
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

struct MockNotifier {
    rec: Recorder,
    fail: AtomicBool,
    subjects: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn send(&self, subject: &str, _body: &str) -> DeployResult<String> {
        self.rec.push("notify");
        if self.fail.load(Ordering::SeqCst) {
            return Err(DeployError::EmailSend("550 rejected".into()));
        }
        self.subjects.lock().unwrap().push(subject.to_string());
        Ok("<1@test>".into())
    }
}

struct Harness {
    orch: Arc<DeployOrchestrator>,
    rec: Recorder,
    resolver: Arc<MockResolver>,
    tasks: Arc<MockTasks>,
    supervisor: Arc<MockSupervisor>,
    notifier: Arc<MockNotifier>,
}

fn harness_with(gate: Option<(Arc<Notify>, Arc<Notify>)>, step_timeout: Duration) -> Harness {
    let rec = Recorder::default();
    let resolver = Arc::new(MockResolver {
        head: Mutex::new(Some("abc123".into())),
        calls: AtomicUsize::new(0),
    });
    let tasks = Arc::new(MockTasks {
        rec: rec.clone(),
        fail_sync: AtomicBool::new(false),
        fail_install: AtomicBool::new(false),
        gate,
    });
    let supervisor = Arc::new(MockSupervisor {
        rec: rec.clone(),
        running: AtomicBool::new(false),
        fail_start: AtomicBool::new(false),
        fail_stop: AtomicBool::new(false),
    });
    let notifier = Arc::new(MockNotifier {
        rec: rec.clone(),
        fail: AtomicBool::new(false),
        subjects: Mutex::new(Vec::new()),
    });
    let orch = DeployOrchestrator::new(
        RepositoryReference::new("a", "b", "main"),
        LaunchSpec::new("node", vec!["index.js".into()], "./repo"),
        Collaborators {
            resolver: resolver.clone(),
            tasks: tasks.clone(),
            supervisor: supervisor.clone(),
            notifier: notifier.clone(),
        },
    )
    .with_step_timeout(step_timeout);
    Harness {
        orch: Arc::new(orch),
        rec,
        resolver,
        tasks,
        supervisor,
        notifier,
    }
}

fn harness() -> Harness {
    harness_with(None, Duration::from_secs(30))
}

const FULL_SEQUENCE: [&str; 5] = ["stop", "sync", "install", "start", "notify"];

// ── redeploy ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn first_tick_redeploys_then_second_tick_is_quiet() {
    let h = harness();

    let outcome = h.orch.run_cycle().await;
    match outcome {
        CycleOutcome::Redeployed { commit, message_id } => {
            assert_eq!(commit.as_str(), "abc123");
            assert_eq!(message_id, "<1@test>");
        }
        other => panic!("expected Redeployed, got {other:?}"),
    }
    assert_eq!(h.rec.take(), FULL_SEQUENCE);
    assert_eq!(h.orch.last_deployed(), Some(CommitId::new("abc123")));
    let subjects = h.notifier.subjects.lock().unwrap().clone();
    assert_eq!(subjects.len(), 1);
    assert!(subjects[0].contains(" b "), "subject names the repo: {}", subjects[0]);

    let outcome = h.orch.run_cycle().await;
    assert!(matches!(
        outcome,
        CycleOutcome::NoChange { restarted: false, .. }
    ));
    assert!(h.rec.take().is_empty(), "no stop/sync/install/start/notify on no change");
    assert_eq!(h.resolver.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.orch.state(), CycleState::Idle);
}

#[tokio::test]
async fn new_commit_triggers_another_full_sequence() {
    let h = harness();
    h.orch.run_cycle().await;
    h.rec.take();

    *h.resolver.head.lock().unwrap() = Some("def456".into());
    let outcome = h.orch.run_cycle().await;
    assert!(matches!(outcome, CycleOutcome::Redeployed { .. }));
    assert_eq!(h.rec.take(), FULL_SEQUENCE);
    assert_eq!(h.orch.last_deployed(), Some(CommitId::new("def456")));
}

#[tokio::test]
async fn events_follow_the_state_machine() {
    let h = harness();
    let mut rx = h.orch.subscribe();
    h.orch.run_cycle().await;

    let mut states = Vec::new();
    while let Ok(evt) = rx.try_recv() {
        states.push(evt.state);
    }
    assert_eq!(
        states,
        vec![
            CycleState::Deciding,
            CycleState::Stopping,
            CycleState::Syncing,
            CycleState::Installing,
            CycleState::Starting,
            CycleState::Notifying,
            CycleState::Idle,
        ]
    );
}

// ── failures ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn install_failure_does_not_advance_or_start() {
    let h = harness();
    h.tasks.fail_install.store(true, Ordering::SeqCst);

    let outcome = h.orch.run_cycle().await;
    match outcome {
        CycleOutcome::Failed { state, error, .. } => {
            assert_eq!(state, CycleState::Installing);
            assert!(matches!(error, DeployError::ShellCommand { exit_code: 1, .. }));
        }
        other => panic!("expected Failed, got {other:?}"),
    }
    assert_eq!(h.rec.take(), ["stop", "sync", "install"]);
    assert_eq!(h.orch.last_deployed(), None);
    assert!(!h.supervisor.is_running());

    // Same head on the next tick retries everything from the stop
    h.tasks.fail_install.store(false, Ordering::SeqCst);
    let outcome = h.orch.run_cycle().await;
    assert!(matches!(outcome, CycleOutcome::Redeployed { .. }));
    assert_eq!(h.rec.take(), FULL_SEQUENCE);
    assert_eq!(h.orch.last_deployed(), Some(CommitId::new("abc123")));
}

#[tokio::test]
async fn sync_failure_leaves_process_stopped() {
    let h = harness();
    h.orch.run_cycle().await;
    h.rec.take();
    assert!(h.supervisor.is_running());

    *h.resolver.head.lock().unwrap() = Some("def456".into());
    h.tasks.fail_sync.store(true, Ordering::SeqCst);
    let outcome = h.orch.run_cycle().await;
    assert!(matches!(
        outcome,
        CycleOutcome::Failed { state: CycleState::Syncing, .. }
    ));
    assert_eq!(h.rec.take(), ["stop", "sync"]);
    assert!(!h.supervisor.is_running());
    assert_eq!(h.orch.last_deployed(), Some(CommitId::new("abc123")));
}

#[tokio::test]
async fn start_failure_does_not_advance_or_notify() {
    let h = harness();
    h.supervisor.fail_start.store(true, Ordering::SeqCst);

    let outcome = h.orch.run_cycle().await;
    match outcome {
        CycleOutcome::Failed { state, commit, error } => {
            assert_eq!(state, CycleState::Starting);
            assert_eq!(commit, Some(CommitId::new("abc123")));
            assert!(matches!(error, DeployError::ProcessSpawn { .. }));
        }
        other => panic!("expected Failed, got {other:?}"),
    }
    assert_eq!(h.rec.take(), ["stop", "sync", "install", "start"]);
    assert_eq!(h.orch.last_deployed(), None);
    assert!(!h.supervisor.is_running());
    assert!(h.notifier.subjects.lock().unwrap().is_empty());

    // Next tick retries the whole sequence, not just the start
    h.supervisor.fail_start.store(false, Ordering::SeqCst);
    let outcome = h.orch.run_cycle().await;
    assert!(matches!(outcome, CycleOutcome::Redeployed { .. }));
    assert_eq!(h.rec.take(), FULL_SEQUENCE);
    assert_eq!(h.orch.last_deployed(), Some(CommitId::new("abc123")));
}

#[tokio::test]
async fn stop_failure_aborts_before_touching_files() {
    let h = harness();
    h.orch.run_cycle().await;
    h.rec.take();

    *h.resolver.head.lock().unwrap() = Some("def456".into());
    h.supervisor.fail_stop.store(true, Ordering::SeqCst);
    let outcome = h.orch.run_cycle().await;
    match outcome {
        CycleOutcome::Failed { state, error, .. } => {
            assert_eq!(state, CycleState::Stopping);
            assert!(matches!(error, DeployError::StopTimeout { pid: 4242, .. }));
        }
        other => panic!("expected Failed, got {other:?}"),
    }
    assert_eq!(h.rec.take(), ["stop"]);
    assert_eq!(h.orch.last_deployed(), Some(CommitId::new("abc123")));
    assert!(h.supervisor.is_running());
    assert_eq!(h.notifier.subjects.lock().unwrap().len(), 1);

    h.supervisor.fail_stop.store(false, Ordering::SeqCst);
    let outcome = h.orch.run_cycle().await;
    assert!(matches!(outcome, CycleOutcome::Redeployed { .. }));
    assert_eq!(h.rec.take(), FULL_SEQUENCE);
    assert_eq!(h.orch.last_deployed(), Some(CommitId::new("def456")));
}

#[tokio::test]
async fn resolver_failure_touches_nothing() {
    let h = harness();
    *h.resolver.head.lock().unwrap() = None;

    let outcome = h.orch.run_cycle().await;
    match outcome {
        CycleOutcome::Failed { state, commit, error } => {
            assert_eq!(state, CycleState::Deciding);
            assert!(commit.is_none());
            assert_eq!(error.kind(), "network");
        }
        other => panic!("expected Failed, got {other:?}"),
    }
    assert!(h.rec.take().is_empty());
    assert_eq!(h.orch.last_deployed(), None);
    assert_eq!(h.orch.state(), CycleState::Idle);
}

#[tokio::test]
async fn notification_failure_fails_cycle_but_keeps_deploy() {
    let h = harness();
    h.notifier.fail.store(true, Ordering::SeqCst);

    let outcome = h.orch.run_cycle().await;
    match outcome {
        CycleOutcome::Failed { state, error, .. } => {
            assert_eq!(state, CycleState::Notifying);
            assert!(matches!(error, DeployError::EmailSend(_)));
        }
        other => panic!("expected Failed, got {other:?}"),
    }
    assert_eq!(h.rec.take(), FULL_SEQUENCE);
    assert_eq!(h.orch.last_deployed(), Some(CommitId::new("abc123")));
    assert!(h.supervisor.is_running());

    // Not retried: the commit is already deployed
    let outcome = h.orch.run_cycle().await;
    assert!(matches!(outcome, CycleOutcome::NoChange { .. }));
    assert!(h.rec.take().is_empty());
}

// ── self-heal ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn no_change_with_dead_process_restarts_once() {
    let h = harness();
    h.orch.run_cycle().await;
    h.rec.take();

    // Simulate a crash
    h.supervisor.running.store(false, Ordering::SeqCst);

    let outcome = h.orch.run_cycle().await;
    assert!(matches!(
        outcome,
        CycleOutcome::NoChange { restarted: true, .. }
    ));
    assert_eq!(h.rec.take(), ["start"]);

    let outcome = h.orch.run_cycle().await;
    assert!(matches!(
        outcome,
        CycleOutcome::NoChange { restarted: false, .. }
    ));
    assert!(h.rec.take().is_empty());
}

// ── single-flight ────────────────────────────────────────────────────────────

#[tokio::test]
async fn overlapping_tick_is_rejected_while_syncing() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let h = harness_with(
        Some((entered.clone(), release.clone())),
        Duration::from_secs(30),
    );

    let orch = Arc::clone(&h.orch);
    let first = tokio::spawn(async move { orch.run_cycle().await });

    entered.notified().await;
    assert_eq!(h.orch.state(), CycleState::Syncing);
    assert!(h.orch.is_cycle_running());

    let second = h.orch.run_cycle().await;
    assert!(matches!(second, CycleOutcome::Skipped));
    assert_eq!(h.resolver.calls.load(Ordering::SeqCst), 1);

    release.notify_one();
    let first = first.await.unwrap();
    assert!(matches!(first, CycleOutcome::Redeployed { .. }));
    assert_eq!(h.rec.take(), FULL_SEQUENCE);
    assert!(!h.orch.is_cycle_running());
}

#[tokio::test]
async fn cancelled_cycle_releases_the_guard() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let h = harness_with(
        Some((entered.clone(), release.clone())),
        Duration::from_secs(30),
    );

    let orch = Arc::clone(&h.orch);
    let first = tokio::spawn(async move { orch.run_cycle().await });
    entered.notified().await;
    first.abort();
    assert!(first.await.unwrap_err().is_cancelled());

    assert!(!h.orch.is_cycle_running());
    assert_eq!(h.orch.state(), CycleState::Idle);
    assert_eq!(h.orch.last_deployed(), None);
}

#[tokio::test(start_paused = true)]
async fn hung_step_times_out_and_aborts() {
    // Gate is never released: sync hangs until the step bound fires
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let h = harness_with(Some((entered, release)), Duration::from_secs(5));

    let outcome = h.orch.run_cycle().await;
    match outcome {
        CycleOutcome::Failed { state, error, .. } => {
            assert_eq!(state, CycleState::Syncing);
            assert!(matches!(error, DeployError::StepTimeout { .. }));
        }
        other => panic!("expected Failed, got {other:?}"),
    }
    assert_eq!(h.rec.take(), ["stop", "sync"]);
    assert_eq!(h.orch.last_deployed(), None);
    assert!(!h.orch.is_cycle_running());
}
