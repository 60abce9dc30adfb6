use std::{io::IsTerminal, path::Path};

use anyhow::{Context, Result};
use dialoguer::{theme::ColorfulTheme, Input, Password};
use shipwatch_core::config::Config;
use tracing::info;

/// Load the config, running the interactive wizard first when required keys
/// are missing and someone is at the terminal.
pub fn load_or_prompt(path: &Path) -> Result<Config> {
    let config = Config::load(path);
    let missing = config.missing_keys();
    if missing.is_empty() {
        return Ok(config);
    }
    if !std::io::stdin().is_terminal() {
        anyhow::bail!(
            "missing required config {} (set them in {} or the environment)",
            missing.join(", "),
            path.display()
        );
    }

    run_wizard(path, &config)?;
    info!(path = %path.display(), "configuration saved");
    Ok(Config::load(path))
}

fn run_wizard(path: &Path, current: &Config) -> Result<()> {
    println!(
        "No usable configuration at {}. Answer a few questions to create one.",
        path.display()
    );
    let theme = ColorfulTheme::default();
    let mut answers = Vec::new();

    for (key, value) in current.entries() {
        let answer = if SECRET_KEYS.contains(&key) {
            let prompt = if value.is_empty() {
                describe(key).to_string()
            } else {
                format!("{} (blank keeps the current one)", describe(key))
            };
            let typed = Password::with_theme(&theme)
                .with_prompt(prompt)
                .allow_empty_password(true)
                .interact()
                .with_context(|| format!("read {key}"))?;
            keep_if_blank(typed, &value)
        } else {
            let mut input = Input::<String>::with_theme(&theme)
                .with_prompt(describe(key))
                .allow_empty(true);
            if !value.is_empty() {
                input = input.default(value);
            }
            let typed: String = input
                .interact_text()
                .with_context(|| format!("read {key}"))?;
            typed.trim().to_string()
        };
        answers.push((key, answer));
    }

    Config::write_dotenv(path, &answers)
}

/// Keys read without echo.
const SECRET_KEYS: &[&str] = &["GITHUB_TOKEN", "SMTP_PASSWORD"];

/// A blank secret answer means "leave it as it is".
fn keep_if_blank(answer: String, current: &str) -> String {
    if answer.trim().is_empty() {
        current.to_string()
    } else {
        answer
    }
}

fn describe(key: &str) -> &'static str {
    match key {
        "REPO_OWNER" => "Repository owner",
        "REPO_NAME" => "Repository name",
        "REPO_BRANCH" => "Branch to watch",
        "REPO_URL" => "Clone URL",
        "GITHUB_API_URL" => "GitHub API base URL",
        "GITHUB_TOKEN" => "GitHub token (blank for anonymous)",
        "POLL_INTERVAL_S" => "Poll interval (seconds)",
        "DEPLOY_PATH" => "Local deployment path",
        "ENTRY_FILE" => "Application entry file",
        "APP_RUNTIME" => "Program that runs the entry file",
        "DEPS_MANIFEST" => "Dependency manifest file",
        "INSTALL_CMD" => "Dependency install command",
        "NOTIFY_EMAIL" => "Notification email (blank to disable)",
        "EMAIL_FROM" => "Sender address",
        "SMTP_HOST" => "SMTP host",
        "SMTP_PORT" => "SMTP port",
        "SMTP_USER" => "SMTP user",
        "SMTP_PASSWORD" => "SMTP password",
        "STOP_TIMEOUT_S" => "Graceful stop timeout (seconds)",
        "STEP_TIMEOUT_S" => "Per-step timeout (seconds)",
        _ => "Value",
    }
}
