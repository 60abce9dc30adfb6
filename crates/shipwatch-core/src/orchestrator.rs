use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::{
    error::{DeployError, DeployResult},
    notify::{deploy_message, Notifier},
    resolver::HeadResolver,
    shell::TaskRunner,
    supervisor::Supervisor,
    types::{CommitId, CycleOutcome, CycleState, DeployEvent, LaunchSpec, RepositoryReference},
};

pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(600);

/// The external pieces a cycle drives.
pub struct Collaborators {
    pub resolver: Arc<dyn HeadResolver>,
    pub tasks: Arc<dyn TaskRunner>,
    pub supervisor: Arc<dyn Supervisor>,
    pub notifier: Arc<dyn Notifier>,
}

struct MonitorState {
    last_deployed: Option<CommitId>,
    current: CycleState,
}

pub struct DeployOrchestrator {
    repo: RepositoryReference,
    launch: LaunchSpec,
    resolver: Arc<dyn HeadResolver>,
    tasks: Arc<dyn TaskRunner>,
    supervisor: Arc<dyn Supervisor>,
    notifier: Arc<dyn Notifier>,
    step_timeout: Duration,
    state: Mutex<MonitorState>,
    in_flight: AtomicBool,
    event_tx: broadcast::Sender<DeployEvent>,
}

/// Held for the duration of one cycle. Dropping it (normal return, early
/// return, or the cycle future being cancelled) releases single-flight and
/// puts the machine back in `Idle`.
struct CycleGuard<'a> {
    orch: &'a DeployOrchestrator,
}

impl<'a> CycleGuard<'a> {
    fn acquire(orch: &'a DeployOrchestrator) -> Option<Self> {
        orch.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { orch })
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.orch.transition(CycleState::Idle, None, "cycle finished");
        self.orch.in_flight.store(false, Ordering::Release);
    }
}

impl DeployOrchestrator {
    pub fn new(repo: RepositoryReference, launch: LaunchSpec, parts: Collaborators) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            repo,
            launch,
            resolver: parts.resolver,
            tasks: parts.tasks,
            supervisor: parts.supervisor,
            notifier: parts.notifier,
            step_timeout: DEFAULT_STEP_TIMEOUT,
            state: Mutex::new(MonitorState {
                last_deployed: None,
                current: CycleState::Idle,
            }),
            in_flight: AtomicBool::new(false),
            event_tx,
        }
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeployEvent> {
        self.event_tx.subscribe()
    }

    pub fn repository(&self) -> &RepositoryReference {
        &self.repo
    }

    pub fn supervisor(&self) -> &Arc<dyn Supervisor> {
        &self.supervisor
    }

    pub fn last_deployed(&self) -> Option<CommitId> {
        self.lock_state().last_deployed.clone()
    }

    pub fn state(&self) -> CycleState {
        self.lock_state().current
    }

    pub fn is_cycle_running(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Run one tick. Never overlaps with another tick: a call made while a
    /// cycle is in flight returns [`CycleOutcome::Skipped`] immediately.
    pub async fn run_cycle(&self) -> CycleOutcome {
        let Some(_guard) = CycleGuard::acquire(self) else {
            return CycleOutcome::Skipped;
        };
        self.cycle().await
    }

    async fn cycle(&self) -> CycleOutcome {
        self.transition(CycleState::Deciding, None, "resolving remote head");
        let head = match self
            .bounded(CycleState::Deciding, self.resolver.resolve_head(&self.repo))
            .await
        {
            Ok(head) => head,
            Err(error) => return self.failed(CycleState::Deciding, None, error),
        };

        // An unset last commit never matches, so a fresh daemon always redeploys
        let previous = self.last_deployed();
        if previous.as_ref() == Some(&head) {
            if self.supervisor.is_running() {
                debug!(commit = %head.short(), "no change");
                return CycleOutcome::NoChange {
                    commit: head,
                    restarted: false,
                };
            }
            info!(commit = %head.short(), "application not running, restarting it");
            self.transition(CycleState::Starting, Some(&head), "self-heal start");
            if let Err(error) = self.supervisor.start(&self.launch).await {
                return self.failed(CycleState::Starting, Some(head), error);
            }
            return CycleOutcome::NoChange {
                commit: head,
                restarted: true,
            };
        }

        info!(
            repo = %self.repo,
            commit = %head.short(),
            previous = previous.as_ref().map(CommitId::short).unwrap_or("none"),
            "new commit detected, redeploying"
        );

        // Stop before touching any files so the app never runs a half-synced tree
        self.transition(CycleState::Stopping, Some(&head), "stopping application");
        if let Err(error) = self.supervisor.stop().await {
            return self.failed(CycleState::Stopping, Some(head), error);
        }

        self.transition(CycleState::Syncing, Some(&head), "syncing working copy");
        if let Err(error) = self.bounded(CycleState::Syncing, self.tasks.sync()).await {
            return self.failed(CycleState::Syncing, Some(head), error);
        }

        self.transition(CycleState::Installing, Some(&head), "installing dependencies");
        if let Err(error) = self.bounded(CycleState::Installing, self.tasks.install()).await {
            return self.failed(CycleState::Installing, Some(head), error);
        }

        self.transition(CycleState::Starting, Some(&head), "starting application");
        if let Err(error) = self.supervisor.start(&self.launch).await {
            return self.failed(CycleState::Starting, Some(head), error);
        }

        // The deploy is done; a failed email below does not undo it
        self.lock_state().last_deployed = Some(head.clone());

        self.transition(CycleState::Notifying, Some(&head), "sending notification");
        let (subject, body) = deploy_message(&self.repo, &head, Utc::now());
        match self
            .bounded(CycleState::Notifying, self.notifier.send(&subject, &body))
            .await
        {
            Ok(message_id) => CycleOutcome::Redeployed {
                commit: head,
                message_id,
            },
            Err(error) => self.failed(CycleState::Notifying, Some(head), error),
        }
    }

    async fn bounded<T, F>(&self, state: CycleState, fut: F) -> DeployResult<T>
    where
        F: Future<Output = DeployResult<T>> + Send,
    {
        match tokio::time::timeout(self.step_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(DeployError::StepTimeout {
                step: state.to_string(),
                after: self.step_timeout,
            }),
        }
    }

    fn failed(&self, state: CycleState, commit: Option<CommitId>, error: DeployError) -> CycleOutcome {
        let message = format!("{state} failed: {error}");
        self.transition(state, commit.as_ref(), &message);
        CycleOutcome::Failed {
            state,
            commit,
            error,
        }
    }

    fn transition(&self, state: CycleState, commit: Option<&CommitId>, message: &str) {
        self.lock_state().current = state;
        let _ = self.event_tx.send(DeployEvent {
            state,
            commit: commit.cloned(),
            message: message.to_string(),
        });
    }

    fn lock_state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
