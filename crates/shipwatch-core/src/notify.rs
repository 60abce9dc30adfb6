use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::{
        authentication::Credentials,
        client::{Tls, TlsParameters},
    },
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use tracing::info;

use crate::{
    error::{DeployError, DeployResult},
    types::{CommitId, RepositoryReference},
};

/// Port on which SMTP speaks TLS from the first byte.
pub const SMTPS_PORT: u16 = 465;

/// Delivers a deploy report. Returns the message id on success.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, subject: &str, body: &str) -> DeployResult<String>;
}

/// Subject and body for a successful redeploy.
pub fn deploy_message(
    repo: &RepositoryReference,
    commit: &CommitId,
    deployed_at: DateTime<Utc>,
) -> (String, String) {
    let subject = format!("[shipwatch] {} deployed at {}", repo.name, commit.short());
    let body = format!(
        "Repository: {}\nBranch: {}\nCommit: {}\nDeployed at: {}\n\n\
         The application was stopped, synced, reinstalled and restarted.\n",
        repo.slug(),
        repo.branch,
        commit,
        deployed_at.to_rfc3339(),
    );
    (subject, body)
}

pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
}

impl SmtpNotifier {
    /// TLS-on-connect when `port` is 465, opportunistic STARTTLS otherwise.
    /// Credentials are only attached when `user` is non-empty.
    pub fn new(
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        from: &str,
        to: &str,
    ) -> DeployResult<Self> {
        let params = TlsParameters::new(host.to_string())
            .map_err(|e| DeployError::EmailSend(format!("tls setup for {host}: {e}")))?;
        let tls = if port == SMTPS_PORT {
            Tls::Wrapper(params)
        } else {
            Tls::Opportunistic(params)
        };

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
            .port(port)
            .tls(tls);
        if !user.is_empty() {
            builder = builder.credentials(Credentials::new(user.to_string(), password.to_string()));
        }

        Ok(Self {
            transport: builder.build(),
            from: parse_mailbox(from)?,
            to: parse_mailbox(to)?,
        })
    }

    fn message_id(&self) -> String {
        format!(
            "<{}.{:08x}@{}>",
            Utc::now().timestamp_millis(),
            rand::random::<u32>(),
            self.from.email.domain()
        )
    }
}

fn parse_mailbox(addr: &str) -> DeployResult<Mailbox> {
    addr.parse()
        .map_err(|e| DeployError::EmailSend(format!("invalid address {addr:?}: {e}")))
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send(&self, subject: &str, body: &str) -> DeployResult<String> {
        let id = self.message_id();
        let email = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(subject)
            .message_id(Some(id.clone()))
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| DeployError::EmailSend(format!("build message: {e}")))?;

        self.transport
            .send(email)
            .await
            .map_err(|e| DeployError::EmailSend(e.to_string()))?;
        info!(message_id = %id, to = %self.to, "notification sent");
        Ok(id)
    }
}

/// Used when no recipient or SMTP host is configured: the report only
/// goes to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, subject: &str, body: &str) -> DeployResult<String> {
        info!(subject, "email disabled, deploy report:\n{body}");
        Ok(format!("log-{}", Utc::now().timestamp_millis()))
    }
}
