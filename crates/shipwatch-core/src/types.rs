use std::{fmt, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::DeployError;

// ── Repository ───────────────────────────────────────────────────────────

/// The single branch being watched. Fixed for the lifetime of the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryReference {
    pub owner: String,
    pub name: String,
    pub branch: String,
}

impl RepositoryReference {
    pub fn new(
        owner: impl Into<String>,
        name: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            branch: branch.into(),
        }
    }

    /// `owner/name`, the form the hosting service uses in URLs.
    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl fmt::Display for RepositoryReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.owner, self.name, self.branch)
    }
}

/// Opaque commit handle. Only ever compared for equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitId(String);

impl CommitId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, for log lines and email subjects.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Supervised application ───────────────────────────────────────────────

/// How to launch the supervised application: `program entry_file`, run in
/// the deployment directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            cwd: cwd.into(),
        }
    }

    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

// ── Deploy cycle ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Idle,
    /// Resolving the remote head and comparing it to the last deploy.
    Deciding,
    Stopping,
    Syncing,
    Installing,
    Starting,
    Notifying,
}

impl CycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Deciding => "deciding",
            Self::Stopping => "stopping",
            Self::Syncing => "syncing",
            Self::Installing => "installing",
            Self::Starting => "starting",
            Self::Notifying => "notifying",
        }
    }
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one tick did. Consumed immediately for logging; never persisted.
#[derive(Debug)]
pub enum CycleOutcome {
    /// Another cycle was still running; this tick did nothing.
    Skipped,
    /// Remote head matched the last deploy. `restarted` is true when the
    /// app was found dead and started again.
    NoChange { commit: CommitId, restarted: bool },
    /// Full stop/sync/install/start sequence ran and the email went out.
    Redeployed { commit: CommitId, message_id: String },
    /// The cycle aborted in `state`. `commit` is the resolved head, if the
    /// cycle got that far.
    Failed {
        state: CycleState,
        commit: Option<CommitId>,
        error: DeployError,
    },
}

impl CycleOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Broadcast on every state transition of the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct DeployEvent {
    pub state: CycleState,
    pub commit: Option<CommitId>,
    pub message: String,
}
