use std::time::Duration;

use thiserror::Error;

/// Everything that can go wrong inside one deploy cycle.
///
/// Each variant belongs to one collaborator: the head resolver produces
/// `Network`/`Api`/`Parse`, the shell runner `ShellCommand`/`Manifest`, the
/// supervisor `ProcessSpawn`/`StopTimeout`, the notifier `EmailSend`.
/// `StepTimeout` is raised by the orchestrator when a step exceeds its bound.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("network error: {0}")]
    Network(String),

    #[error("hosting API returned status {status}")]
    Api { status: u16 },

    #[error("could not parse hosting API response: {0}")]
    Parse(String),

    #[error("command `{command}` exited with code {exit_code}: {output}")]
    ShellCommand {
        command: String,
        exit_code: i32,
        output: String,
    },

    #[error("could not read dependency manifest {path}: {reason}")]
    Manifest { path: String, reason: String },

    #[error("failed to spawn `{command}`: {reason}")]
    ProcessSpawn { command: String, reason: String },

    #[error("process {pid} did not exit within {waited:?} after SIGKILL")]
    StopTimeout { pid: u32, waited: Duration },

    #[error("{step} step timed out after {after:?}")]
    StepTimeout { step: String, after: Duration },

    #[error("failed to send notification email: {0}")]
    EmailSend(String),
}

impl DeployError {
    /// Short machine-friendly name, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Api { .. } => "api",
            Self::Parse(_) => "parse",
            Self::ShellCommand { .. } => "shell_command",
            Self::Manifest { .. } => "manifest",
            Self::ProcessSpawn { .. } => "process_spawn",
            Self::StopTimeout { .. } => "stop_timeout",
            Self::StepTimeout { .. } => "step_timeout",
            Self::EmailSend(_) => "email_send",
        }
    }
}

pub type DeployResult<T> = std::result::Result<T, DeployError>;
