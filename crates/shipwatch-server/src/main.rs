mod setup;

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use shipwatch_core::{
    config::DEFAULT_CONFIG_FILE,
    notify::{LogNotifier, Notifier, SmtpNotifier},
    orchestrator::{Collaborators, DeployOrchestrator},
    resolver::GitHubResolver,
    scheduler::Scheduler,
    shell::ShellRunner,
    supervisor::{ProcessSupervisor, Supervisor},
};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

// ── main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config_path = std::env::var("SHIPWATCH_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
    let config = setup::load_or_prompt(&config_path)?;
    config.validate()?;

    let runner = Arc::new(ShellRunner::new(
        &config.deploy_path,
        &config.repo_url,
        &config.branch,
        &config.deps_manifest,
        &config.install_cmd,
    ));

    // Without a working copy there is nothing to deploy
    if runner
        .ensure_checkout()
        .await
        .with_context(|| format!("initial clone of {} failed", config.repo_url))?
    {
        info!(path = %config.deploy_path, "initial clone complete");
    }

    let resolver = Arc::new(GitHubResolver::new(
        &config.github_api_url,
        &config.github_token,
        config.step_timeout(),
    )?);
    let supervisor: Arc<dyn Supervisor> = Arc::new(ProcessSupervisor::new(config.stop_timeout()));
    let notifier: Arc<dyn Notifier> = if config.email_enabled() {
        Arc::new(SmtpNotifier::new(
            &config.smtp_host,
            config.smtp_port,
            &config.smtp_user,
            &config.smtp_password,
            &config.email_from,
            &config.notify_email,
        )?)
    } else {
        warn!("NOTIFY_EMAIL or SMTP_HOST not set, deploy reports go to the log only");
        Arc::new(LogNotifier)
    };

    let orchestrator = Arc::new(
        DeployOrchestrator::new(
            config.repository(),
            config.launch_spec(),
            Collaborators {
                resolver,
                tasks: runner,
                supervisor: Arc::clone(&supervisor),
                notifier,
            },
        )
        .with_step_timeout(config.step_timeout()),
    );

    // Forward state transitions to the log
    {
        let mut rx = orchestrator.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(evt) => {
                        debug!(state = %evt.state, commit = ?evt.commit, "{}", evt.message);
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }
        });
    }

    Scheduler::new(Arc::clone(&orchestrator), config.poll_interval())
        .run(shutdown_signal())
        .await;

    info!("shutting down, stopping application");
    if let Err(e) = supervisor.stop().await {
        error!("failed to stop application: {e}");
    }
    Ok(())
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "shipwatch=info,shipwatch_core=info".into());
    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}
