//! Lifecycle of the one supervised application process.
//!
//! The child is owned by a background observer task that waits for it to
//! exit. The observer clears the handle and publishes the exit on a
//! `watch` channel, so callers only ever see `start`, `stop` and
//! `is_running`. A crash therefore leaves the supervisor with no handle,
//! and the next no-change tick restarts the app.

use std::{
    process::Stdio,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    process::Command,
    sync::{oneshot, watch},
};
use tracing::{debug, info, warn};

use crate::{
    error::{DeployError, DeployResult},
    types::LaunchSpec,
};

/// How long to wait after SIGKILL before giving up on a stop. A failed stop
/// reports the whole wait, graceful period included.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Spawn the app unless it is already running.
    async fn start(&self, launch: &LaunchSpec) -> DeployResult<()>;

    /// Terminate the app and wait for it to exit. No-op when nothing runs.
    async fn stop(&self) -> DeployResult<()>;

    fn is_running(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

struct Handle {
    generation: u64,
    pid: u32,
    exited: watch::Receiver<Option<ExitInfo>>,
    kill: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    stop_requested: Arc<AtomicBool>,
}

#[derive(Default)]
struct Shared {
    current: Mutex<Option<Handle>>,
    last_exit: Mutex<Option<ExitInfo>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct ProcessSupervisor {
    shared: Arc<Shared>,
    next_generation: AtomicU64,
    stop_timeout: Duration,
    kill_grace: Duration,
}

impl ProcessSupervisor {
    pub fn new(stop_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            next_generation: AtomicU64::new(1),
            stop_timeout,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn pid(&self) -> Option<u32> {
        lock(&self.shared.current).as_ref().map(|h| h.pid)
    }

    pub fn last_exit(&self) -> Option<ExitInfo> {
        *lock(&self.shared.last_exit)
    }

    pub fn last_exit_code(&self) -> Option<i32> {
        self.last_exit().and_then(|e| e.code)
    }

    fn clear(&self, generation: u64) {
        let mut slot = lock(&self.shared.current);
        if slot.as_ref().map(|h| h.generation) == Some(generation) {
            *slot = None;
        }
    }
}

#[async_trait]
impl Supervisor for ProcessSupervisor {
    async fn start(&self, launch: &LaunchSpec) -> DeployResult<()> {
        let mut slot = lock(&self.shared.current);
        if let Some(h) = slot.as_ref() {
            info!(pid = h.pid, "application already running, start is a no-op");
            return Ok(());
        }

        let mut child = Command::new(&launch.program)
            .args(&launch.args)
            .current_dir(&launch.cwd)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DeployError::ProcessSpawn {
                command: launch.display(),
                reason: e.to_string(),
            })?;

        let pid = child.id().unwrap_or(0);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let stop_requested = Arc::new(AtomicBool::new(false));

        *slot = Some(Handle {
            generation,
            pid,
            exited: exit_rx,
            kill: Arc::new(Mutex::new(Some(kill_tx))),
            stop_requested: Arc::clone(&stop_requested),
        });
        drop(slot);
        info!(pid, command = %launch.display(), cwd = %launch.cwd.display(), "application started");

        // Exit observer: owns the child until it terminates for any reason
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Ok(()) = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let info = match status {
                Ok(s) => exit_info(&s),
                Err(e) => {
                    warn!(pid, "failed to wait for application: {e}");
                    ExitInfo { code: None, signal: None }
                }
            };

            {
                let mut slot = lock(&shared.current);
                if slot.as_ref().map(|h| h.generation) == Some(generation) {
                    *slot = None;
                }
            }
            *lock(&shared.last_exit) = Some(info);

            if stop_requested.load(Ordering::Acquire) {
                info!(pid, code = ?info.code, signal = ?info.signal, "application exited");
            } else {
                warn!(pid, code = ?info.code, signal = ?info.signal, "application exited unexpectedly");
            }
            let _ = exit_tx.send(Some(info));
        });

        Ok(())
    }

    async fn stop(&self) -> DeployResult<()> {
        let target = {
            let slot = lock(&self.shared.current);
            slot.as_ref().map(|h| {
                (
                    h.generation,
                    h.pid,
                    h.exited.clone(),
                    Arc::clone(&h.kill),
                    Arc::clone(&h.stop_requested),
                )
            })
        };
        let Some((generation, pid, mut exited, kill, stop_requested)) = target else {
            debug!("no application running, stop is a no-op");
            return Ok(());
        };

        stop_requested.store(true, Ordering::Release);
        info!(pid, "stopping application");

        let graceful = request_terminate(pid);
        let mut waited = Duration::ZERO;
        let exited_in_time = graceful
            && tokio::time::timeout(self.stop_timeout, wait_exit(&mut exited))
                .await
                .is_ok();

        if !exited_in_time {
            if graceful {
                waited += self.stop_timeout;
                warn!(pid, timeout = ?self.stop_timeout, "application ignored SIGTERM, sending SIGKILL");
            }
            if let Some(tx) = lock(&kill).take() {
                let _ = tx.send(());
            }
            waited += self.kill_grace;
            if tokio::time::timeout(self.kill_grace, wait_exit(&mut exited))
                .await
                .is_err()
            {
                return Err(DeployError::StopTimeout { pid, waited });
            }
        }

        self.clear(generation);
        Ok(())
    }

    fn is_running(&self) -> bool {
        lock(&self.shared.current).is_some()
    }
}

async fn wait_exit(rx: &mut watch::Receiver<Option<ExitInfo>>) {
    while rx.borrow_and_update().is_none() {
        if rx.changed().await.is_err() {
            // Observer is gone; the child can no longer be running
            return;
        }
    }
}

#[cfg(unix)]
fn exit_info(status: &std::process::ExitStatus) -> ExitInfo {
    use std::os::unix::process::ExitStatusExt;
    ExitInfo {
        code: status.code(),
        signal: status.signal(),
    }
}

#[cfg(not(unix))]
fn exit_info(status: &std::process::ExitStatus) -> ExitInfo {
    ExitInfo {
        code: status.code(),
        signal: None,
    }
}

/// Ask the process to exit. Returns false when no graceful path exists.
#[cfg(unix)]
fn request_terminate(pid: u32) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw == 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            debug!(pid, "SIGTERM failed: {e}");
            false
        }
    }
}

#[cfg(not(unix))]
fn request_terminate(_pid: u32) -> bool {
    false
}
