use std::{collections::HashMap, path::Path, time::Duration};

use anyhow::{Context, Result};

use crate::types::{LaunchSpec, RepositoryReference};

/// Keys that have no usable default.
pub const REQUIRED_KEYS: &[&str] = &["REPO_OWNER", "REPO_NAME"];

/// Default dotenv file, relative to the daemon's working directory.
pub const DEFAULT_CONFIG_FILE: &str = ".env";

/// Full daemon configuration.
/// Process environment wins over the dotenv file; the file wins over defaults.
#[derive(Debug, Clone)]
pub struct Config {
    // Repository
    pub repo_owner: String,
    pub repo_name: String,
    pub branch: String,
    pub repo_url: String,
    pub github_api_url: String,
    pub github_token: String,

    pub poll_interval_s: u64,

    // Deployment
    pub deploy_path: String,
    pub entry_file: String,
    pub app_runtime: String,
    pub deps_manifest: String,
    pub install_cmd: String,

    // Notification
    pub notify_email: String,
    pub email_from: String,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_user: String,
    pub smtp_password: String,

    // Bounds
    pub stop_timeout_s: u64,
    pub step_timeout_s: u64,
}

/// Parse `KEY=value` lines. Blank lines and `#` comments are skipped.
/// Single-quoted values are taken literally; double-quoted values may escape
/// `\"` and `\\`.
pub fn parse_dotenv_str(contents: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), unquote(v.trim()));
        }
    }
    map
}

fn unquote(v: &str) -> String {
    if v.len() >= 2 && v.starts_with('\'') && v.ends_with('\'') {
        return v[1..v.len() - 1].to_string();
    }
    if v.len() >= 2 && v.starts_with('"') && v.ends_with('"') {
        let mut out = String::with_capacity(v.len() - 2);
        let mut chars = v[1..v.len() - 1].chars();
        while let Some(c) = chars.next() {
            match (c, chars.clone().next()) {
                ('\\', Some(next @ ('"' | '\\'))) => {
                    out.push(next);
                    chars.next();
                }
                _ => out.push(c),
            }
        }
        return out;
    }
    v.to_string()
}

/// Render a value so that [`parse_dotenv_str`] reads it back unchanged.
fn quote(v: &str) -> String {
    let plain = !v.is_empty()
        && !v
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '#' | '"' | '\'' | '\\'));
    if plain {
        return v.to_string();
    }
    let mut out = String::with_capacity(v.len() + 2);
    out.push('"');
    for c in v.chars() {
        if matches!(c, '"' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

fn parse_dotenv(path: &Path) -> HashMap<String, String> {
    match std::fs::read_to_string(path) {
        Ok(contents) => parse_dotenv_str(&contents),
        Err(_) => HashMap::new(),
    }
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u16(key: &str, dotenv: &HashMap<String, String>, default: u16) -> u16 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn resolve_tilde(path: &str) -> String {
    if path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{}/{}", home, path.strip_prefix("~/").unwrap_or(path));
        }
    }
    path.to_string()
}

impl Config {
    /// Load from the process environment and the dotenv file at `path`.
    pub fn load(path: &Path) -> Self {
        Self::from_map(&parse_dotenv(path))
    }

    /// Build from an already-parsed dotenv map (environment still wins).
    pub fn from_map(dotenv: &HashMap<String, String>) -> Self {
        let repo_owner = get_str("REPO_OWNER", dotenv, "");
        let repo_name = get_str("REPO_NAME", dotenv, "");
        let default_url = if repo_owner.is_empty() || repo_name.is_empty() {
            String::new()
        } else {
            format!("https://github.com/{repo_owner}/{repo_name}.git")
        };
        let smtp_user = get_str("SMTP_USER", dotenv, "");

        Config {
            repo_url: get_str("REPO_URL", dotenv, &default_url),
            repo_owner,
            repo_name,
            branch: get_str("REPO_BRANCH", dotenv, "main"),
            github_api_url: get_str("GITHUB_API_URL", dotenv, "https://api.github.com"),
            github_token: get_str("GITHUB_TOKEN", dotenv, ""),
            poll_interval_s: get_u64("POLL_INTERVAL_S", dotenv, 60),
            deploy_path: resolve_tilde(&get_str("DEPLOY_PATH", dotenv, "./repo")),
            entry_file: get_str("ENTRY_FILE", dotenv, "index.js"),
            app_runtime: get_str("APP_RUNTIME", dotenv, "node"),
            deps_manifest: get_str("DEPS_MANIFEST", dotenv, "dependencies.txt"),
            install_cmd: get_str("INSTALL_CMD", dotenv, "npm install"),
            notify_email: get_str("NOTIFY_EMAIL", dotenv, ""),
            email_from: get_str("EMAIL_FROM", dotenv, &smtp_user),
            smtp_host: get_str("SMTP_HOST", dotenv, ""),
            smtp_port: get_u16("SMTP_PORT", dotenv, 587),
            smtp_user,
            smtp_password: get_str("SMTP_PASSWORD", dotenv, ""),
            stop_timeout_s: get_u64("STOP_TIMEOUT_S", dotenv, 10),
            step_timeout_s: get_u64("STEP_TIMEOUT_S", dotenv, 600),
        }
    }

    /// Required keys that are still empty.
    pub fn missing_keys(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.repo_owner.is_empty() {
            missing.push("REPO_OWNER");
        }
        if self.repo_name.is_empty() {
            missing.push("REPO_NAME");
        }
        missing
    }

    pub fn validate(&self) -> Result<()> {
        let missing = self.missing_keys();
        if !missing.is_empty() {
            anyhow::bail!("missing required config: {}", missing.join(", "));
        }
        if self.poll_interval_s == 0 {
            anyhow::bail!("POLL_INTERVAL_S must be greater than zero");
        }
        if self.branch.is_empty() {
            anyhow::bail!("REPO_BRANCH must not be empty");
        }
        if self.email_enabled() && self.email_from.is_empty() {
            anyhow::bail!("EMAIL_FROM (or SMTP_USER) is required when NOTIFY_EMAIL is set");
        }
        Ok(())
    }

    /// Whether an SMTP transport can be built at all.
    pub fn email_enabled(&self) -> bool {
        !self.notify_email.is_empty() && !self.smtp_host.is_empty()
    }

    pub fn repository(&self) -> RepositoryReference {
        RepositoryReference::new(&self.repo_owner, &self.repo_name, &self.branch)
    }

    pub fn launch_spec(&self) -> LaunchSpec {
        LaunchSpec::new(
            &self.app_runtime,
            vec![self.entry_file.clone()],
            &self.deploy_path,
        )
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_s)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_s)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_s)
    }

    /// Every key with its current value, in the order the setup wizard asks.
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        vec![
            ("REPO_OWNER", self.repo_owner.clone()),
            ("REPO_NAME", self.repo_name.clone()),
            ("REPO_BRANCH", self.branch.clone()),
            ("REPO_URL", self.repo_url.clone()),
            ("GITHUB_API_URL", self.github_api_url.clone()),
            ("GITHUB_TOKEN", self.github_token.clone()),
            ("POLL_INTERVAL_S", self.poll_interval_s.to_string()),
            ("DEPLOY_PATH", self.deploy_path.clone()),
            ("ENTRY_FILE", self.entry_file.clone()),
            ("APP_RUNTIME", self.app_runtime.clone()),
            ("DEPS_MANIFEST", self.deps_manifest.clone()),
            ("INSTALL_CMD", self.install_cmd.clone()),
            ("NOTIFY_EMAIL", self.notify_email.clone()),
            ("EMAIL_FROM", self.email_from.clone()),
            ("SMTP_HOST", self.smtp_host.clone()),
            ("SMTP_PORT", self.smtp_port.to_string()),
            ("SMTP_USER", self.smtp_user.clone()),
            ("SMTP_PASSWORD", self.smtp_password.clone()),
            ("STOP_TIMEOUT_S", self.stop_timeout_s.to_string()),
            ("STEP_TIMEOUT_S", self.step_timeout_s.to_string()),
        ]
    }

    /// Write `entries` to the dotenv file at `path`. Keys already in the file
    /// that `entries` does not mention are kept, after the given ones.
    pub fn write_dotenv(path: &Path, entries: &[(&str, String)]) -> Result<()> {
        let mut existing = parse_dotenv(path);
        let mut out = String::from("# shipwatch configuration\n");
        for (key, value) in entries {
            existing.remove(*key);
            out.push_str(&format!("{key}={}\n", quote(value)));
        }
        let mut rest: Vec<_> = existing.into_iter().collect();
        rest.sort();
        for (key, value) in rest {
            out.push_str(&format!("{key}={}\n", quote(&value)));
        }
        std::fs::write(path, out).with_context(|| format!("write {}", path.display()))
    }
}
