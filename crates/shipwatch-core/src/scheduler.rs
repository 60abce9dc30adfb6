use std::{future::Future, sync::Arc, time::Duration};

use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::{orchestrator::DeployOrchestrator, types::CycleOutcome};

/// Fires the deploy cycle once immediately, then every `interval`.
///
/// Cycles are awaited inline, so two never overlap. A cycle that outlives
/// its period makes the missed ticks collapse into one instead of queueing.
pub struct Scheduler {
    orchestrator: Arc<DeployOrchestrator>,
    interval: Duration,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<DeployOrchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
        }
    }

    /// Tick until `shutdown` resolves. A cycle still running at shutdown is
    /// dropped; its child commands are killed with it. Returns the number of
    /// ticks fired.
    pub async fn run<F>(&self, shutdown: F) -> u64
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!(
            repo = %self.orchestrator.repository(),
            interval_s = self.interval.as_secs(),
            "watching for new commits"
        );

        let mut ticks = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = ticker.tick() => {}
            }
            ticks += 1;

            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    warn!(tick = ticks, "shutdown requested mid-cycle, abandoning it");
                    break;
                }
                outcome = self.orchestrator.run_cycle() => log_outcome(ticks, &outcome),
            }
        }
        info!(ticks, "scheduler stopped");
        ticks
    }
}

/// Single place where cycle results, including errors, reach the log.
pub fn log_outcome(tick: u64, outcome: &CycleOutcome) {
    match outcome {
        CycleOutcome::Skipped => {
            warn!(tick, "previous cycle still running, tick skipped");
        }
        CycleOutcome::NoChange {
            commit,
            restarted: false,
        } => {
            debug!(tick, commit = %commit.short(), "up to date");
        }
        CycleOutcome::NoChange {
            commit,
            restarted: true,
        } => {
            info!(tick, commit = %commit.short(), "up to date, application restarted");
        }
        CycleOutcome::Redeployed { commit, message_id } => {
            info!(tick, commit = %commit.short(), message_id = %message_id, "redeploy complete");
        }
        CycleOutcome::Failed {
            state,
            commit,
            error,
        } => {
            error!(
                tick,
                step = %state,
                commit = commit.as_ref().map(|c| c.short()).unwrap_or("unknown"),
                kind = error.kind(),
                "deploy cycle failed: {error}"
            );
        }
    }
}
