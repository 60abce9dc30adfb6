use std::{
    io,
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{DeployError, DeployResult};

/// The file-level steps of a redeploy. Each is pass/fail.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Bring the working copy up to the remote branch tip.
    async fn sync(&self) -> DeployResult<()>;

    /// Install the packages listed in the dependency manifest, if any.
    async fn install(&self) -> DeployResult<()>;
}

pub struct ExecResult {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }

    /// Log stderr and turn a nonzero exit into `ShellCommand`.
    fn check(self) -> DeployResult<Self> {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            warn!(command = %self.command, "stderr: {}", stderr);
        }
        if self.success() {
            return Ok(self);
        }
        Err(DeployError::ShellCommand {
            output: self.combined_output().trim().to_string(),
            command: self.command,
            exit_code: self.exit_code,
        })
    }
}

/// Run `program args..` in `dir` and capture its output. Only a failure to
/// spawn is an error here; the exit code is left to the caller.
pub async fn exec(program: &str, args: &[&str], dir: Option<&Path>) -> DeployResult<ExecResult> {
    let command = if args.is_empty() {
        program.to_string()
    } else {
        format!("{program} {}", args.join(" "))
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }

    let output = cmd.output().await.map_err(|e| DeployError::ProcessSpawn {
        command: command.clone(),
        reason: e.to_string(),
    })?;

    Ok(ExecResult {
        command,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

/// Package names from a dependency manifest: one per line, blanks ignored.
pub fn parse_manifest(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// git + package-manager backed [`TaskRunner`] for one working copy.
pub struct ShellRunner {
    deploy_path: PathBuf,
    repo_url: String,
    branch: String,
    manifest: String,
    install_cmd: String,
}

impl ShellRunner {
    pub fn new(
        deploy_path: impl Into<PathBuf>,
        repo_url: impl Into<String>,
        branch: impl Into<String>,
        manifest: impl Into<String>,
        install_cmd: impl Into<String>,
    ) -> Self {
        Self {
            deploy_path: deploy_path.into(),
            repo_url: repo_url.into(),
            branch: branch.into(),
            manifest: manifest.into(),
            install_cmd: install_cmd.into(),
        }
    }

    pub fn deploy_path(&self) -> &Path {
        &self.deploy_path
    }

    fn path_str(&self) -> String {
        self.deploy_path.to_string_lossy().into_owned()
    }

    async fn git(&self, args: &[&str]) -> DeployResult<ExecResult> {
        let dir = self.path_str();
        let mut full = vec!["-C", dir.as_str()];
        full.extend_from_slice(args);
        exec("git", &full, None).await
    }

    /// Clone the repository if the deployment path does not exist yet.
    /// Returns whether a clone happened.
    pub async fn ensure_checkout(&self) -> DeployResult<bool> {
        if self.deploy_path.exists() {
            return Ok(false);
        }
        if let Some(parent) = self.deploy_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| DeployError::ProcessSpawn {
                    command: "git clone".into(),
                    reason: format!("create {}: {e}", parent.display()),
                })?;
            }
        }
        let path = self.path_str();
        info!(url = %self.repo_url, branch = %self.branch, path = %path, "cloning repository");
        exec(
            "git",
            &["clone", "--branch", &self.branch, &self.repo_url, &path],
            None,
        )
        .await?
        .check()?;
        Ok(true)
    }
}

#[async_trait]
impl TaskRunner for ShellRunner {
    async fn sync(&self) -> DeployResult<()> {
        self.git(&["fetch", "origin", &self.branch]).await?.check()?;

        // Try fast-forward first; if diverged, reset hard to the remote branch
        let pull = self.git(&["pull", "--ff-only", "origin", &self.branch]).await?;
        if pull.success() {
            info!(branch = %self.branch, "working copy fast-forwarded");
            return Ok(());
        }
        warn!(
            branch = %self.branch,
            "fast-forward pull failed, resetting to origin: {}",
            pull.combined_output().trim()
        );
        let target = format!("origin/{}", self.branch);
        self.git(&["reset", "--hard", &target]).await?.check()?;
        Ok(())
    }

    async fn install(&self) -> DeployResult<()> {
        let manifest_path = self.deploy_path.join(&self.manifest);
        let packages = match std::fs::read_to_string(&manifest_path) {
            Ok(contents) => parse_manifest(&contents),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(DeployError::Manifest {
                    path: manifest_path.display().to_string(),
                    reason: e.to_string(),
                })
            }
        };
        if packages.is_empty() {
            info!(manifest = %manifest_path.display(), "no dependencies declared, skipping install");
            return Ok(());
        }

        let mut parts = self.install_cmd.split_whitespace();
        let Some(program) = parts.next() else {
            return Err(DeployError::ProcessSpawn {
                command: self.install_cmd.clone(),
                reason: "install command is empty".into(),
            });
        };
        let mut args: Vec<&str> = parts.collect();
        args.extend(packages.iter().map(String::as_str));

        info!(count = packages.len(), "installing dependencies");
        exec(program, &args, Some(&self.deploy_path)).await?.check()?;
        Ok(())
    }
}
