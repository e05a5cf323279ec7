//! Pull request creation on the hosting service

use async_trait::async_trait;
use kiln_core::{KilnError, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const GITHUB_API_URL: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("kiln-worker/", env!("CARGO_PKG_VERSION"));

/// Everything needed to open a pull request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestRequest {
    pub owner: String,
    pub repo: String,
    /// Branch holding the change
    pub head: String,
    /// Branch the change should merge into
    pub base: String,
    pub title: String,
    pub body: String,
}

/// Seam for the hosting service API
#[async_trait]
pub trait HostingService: Send + Sync {
    /// Open a pull request and return its web URL.
    ///
    /// If a pull request for the same head branch is already open, its URL is returned.
    async fn create_pull_request(&self, request: &PullRequestRequest) -> Result<String>;
}

#[derive(Serialize)]
struct CreatePullBody<'a> {
    title: &'a str,
    head: &'a str,
    base: &'a str,
    body: &'a str,
}

#[derive(Deserialize)]
struct PullResponse {
    html_url: String,
}

/// GitHub REST API client
#[derive(Clone)]
pub struct GitHubClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
}

impl std::fmt::Debug for GitHubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubClient")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

impl GitHubClient {
    pub fn new(token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| KilnError::Hosting(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            api_base: GITHUB_API_URL.to_string(),
            token: token.into(),
        })
    }

    /// Point the client at a different API root (GitHub Enterprise, tests)
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.api_base, path))
            .bearer_auth(&self.token)
            .header("accept", "application/vnd.github+json")
    }

    async fn find_open_pull(&self, request: &PullRequestRequest) -> Result<Option<String>> {
        let head = format!("{}:{}", request.owner, request.head);
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/repos/{}/{}/pulls", request.owner, request.repo),
            )
            .query(&[("head", head.as_str()), ("state", "open")])
            .send()
            .await
            .map_err(|e| KilnError::Hosting(format!("Failed to list pull requests: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(KilnError::Hosting(format!(
                "GitHub API error {} listing pull requests: {}",
                status, text
            )));
        }

        let pulls: Vec<PullResponse> = response
            .json()
            .await
            .map_err(|e| KilnError::Hosting(format!("Failed to parse pull request list: {}", e)))?;
        Ok(pulls.into_iter().next().map(|p| p.html_url))
    }
}

#[async_trait]
impl HostingService for GitHubClient {
    async fn create_pull_request(&self, request: &PullRequestRequest) -> Result<String> {
        tracing::debug!(
            repo = %format!("{}/{}", request.owner, request.repo),
            head = %request.head,
            base = %request.base,
            "Opening pull request"
        );

        let body = CreatePullBody {
            title: &request.title,
            head: &request.head,
            base: &request.base,
            body: &request.body,
        };

        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/repos/{}/{}/pulls", request.owner, request.repo),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| KilnError::Hosting(format!("Failed to send pull request: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            let pull: PullResponse = response
                .json()
                .await
                .map_err(|e| KilnError::Hosting(format!("Failed to parse pull request: {}", e)))?;
            return Ok(pull.html_url);
        }

        let text = response.text().await.unwrap_or_default();

        // 422 is also what GitHub answers when the head branch already has an open PR
        if status == reqwest::StatusCode::UNPROCESSABLE_ENTITY && text.contains("already exists") {
            tracing::info!(head = %request.head, "Pull request already open, reusing it");
            if let Some(url) = self.find_open_pull(request).await? {
                return Ok(url);
            }
        }

        Err(KilnError::Hosting(format!(
            "GitHub API error {}: {}",
            status, text
        )))
    }
}

/// In-memory hosting service for tests
#[derive(Clone, Default)]
pub struct MockHostingService {
    requests: Arc<Mutex<Vec<PullRequestRequest>>>,
    failure: Option<String>,
}

impl MockHostingService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with the given message
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            requests: Arc::default(),
            failure: Some(message.into()),
        }
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<PullRequestRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl HostingService for MockHostingService {
    async fn create_pull_request(&self, request: &PullRequestRequest) -> Result<String> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        match &self.failure {
            Some(message) => Err(KilnError::Hosting(message.clone())),
            None => Ok(format!(
                "https://github.com/{}/{}/pull/{}",
                request.owner,
                request.repo,
                self.requests().len()
            )),
        }
    }
}
