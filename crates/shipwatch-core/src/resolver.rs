use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::{
    error::{DeployError, DeployResult},
    types::{CommitId, RepositoryReference},
};

/// Resolves the tip commit of a branch on the hosting service.
#[async_trait]
pub trait HeadResolver: Send + Sync {
    async fn resolve_head(&self, repo: &RepositoryReference) -> DeployResult<CommitId>;
}

/// `GET {api}/repos/{owner}/{name}/commits/{branch}` against the GitHub REST API.
pub struct GitHubResolver {
    api_url: String,
    token: String,
    client: Client,
}

#[derive(Deserialize)]
struct CommitResponse {
    sha: Option<String>,
}

impl GitHubResolver {
    pub fn new(api_url: impl Into<String>, token: impl Into<String>, timeout: Duration) -> DeployResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("shipwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DeployError::Network(format!("build http client: {e}")))?;
        Ok(Self {
            api_url: api_url.into(),
            token: token.into(),
            client,
        })
    }

    fn commit_url(&self, repo: &RepositoryReference) -> String {
        format!(
            "{}/repos/{}/{}/commits/{}",
            self.api_url.trim_end_matches('/'),
            repo.owner,
            repo.name,
            repo.branch
        )
    }
}

#[async_trait]
impl HeadResolver for GitHubResolver {
    async fn resolve_head(&self, repo: &RepositoryReference) -> DeployResult<CommitId> {
        let url = self.commit_url(repo);
        debug!(%url, "resolving remote head");

        let mut req = self
            .client
            .get(&url)
            .header(header::ACCEPT, "application/vnd.github+json");
        if !self.token.is_empty() {
            req = req.bearer_auth(&self.token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| DeployError::Network(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| DeployError::Network(format!("read body: {e}")))?;

        parse_head_response(status, &body)
    }
}

/// Turn a status + body into a commit id. Non-2xx is `Api`; a body that is
/// not JSON or lacks a non-empty `sha` is `Parse`.
pub fn parse_head_response(status: StatusCode, body: &str) -> DeployResult<CommitId> {
    if !status.is_success() {
        return Err(DeployError::Api {
            status: status.as_u16(),
        });
    }
    let parsed: CommitResponse =
        serde_json::from_str(body).map_err(|e| DeployError::Parse(e.to_string()))?;
    match parsed.sha {
        Some(sha) if !sha.trim().is_empty() => Ok(CommitId::new(sha.trim())),
        _ => Err(DeployError::Parse("response has no `sha` field".into())),
    }
}
