//! Coordinator HTTP client

use async_trait::async_trait;
use kiln_core::{Completion, KilnError, LogLevel, PollOutcome, Result};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

use crate::wire::{poll_outcome, CompletionBody, HeartbeatBody, LogBody};

/// Task lifecycle transport
///
/// Every method reports failures as errors; the policy for what a failure means
/// (no work, swallow, log loudly) belongs to the caller.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Ask for one claimable task
    async fn poll(&self) -> Result<PollOutcome>;

    /// Liveness signal carrying the run currently executing, if any
    async fn heartbeat(&self, current_run: Option<&str>) -> Result<()>;

    /// Append a log line to a run
    async fn report_log(&self, run_id: &str, level: LogLevel, message: &str) -> Result<()>;

    /// Terminal report for a run
    async fn report_completion(&self, run_id: &str, completion: &Completion) -> Result<()>;
}

/// reqwest-backed coordinator client with bearer auth
#[derive(Clone)]
pub struct CoordinatorClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl std::fmt::Debug for CoordinatorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl CoordinatorClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| KilnError::Coordinator(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<B: serde::Serialize + Sync + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "POST");
        self.http
            .post(&url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .map_err(|e| KilnError::Coordinator(format!("POST {} failed: {}", path, e)))
    }

    async fn expect_success(path: &str, response: reqwest::Response) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(KilnError::Coordinator(format!(
            "POST {} returned {}: {}",
            path,
            status,
            text.trim()
        )))
    }
}

#[async_trait]
impl Coordinator for CoordinatorClient {
    async fn poll(&self) -> Result<PollOutcome> {
        let response = self.post("/nodes/poll", &serde_json::json!({})).await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(PollOutcome::NoWork),
            StatusCode::OK => {
                let text = response.text().await.map_err(|e| {
                    KilnError::Coordinator(format!("Failed to read poll response: {}", e))
                })?;
                let body: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
                    KilnError::Protocol(format!("Malformed poll response: {}", e))
                })?;
                poll_outcome(body)
            }
            _ => {
                Self::expect_success("/nodes/poll", response).await?;
                Err(KilnError::Protocol(
                    "unexpected success status from /nodes/poll".to_string(),
                ))
            }
        }
    }

    async fn heartbeat(&self, current_run: Option<&str>) -> Result<()> {
        let body = HeartbeatBody {
            current_job_id: current_run,
        };
        let response = self.post("/nodes/heartbeat", &body).await?;
        Self::expect_success("/nodes/heartbeat", response).await
    }

    async fn report_log(&self, run_id: &str, level: LogLevel, message: &str) -> Result<()> {
        let path = format!("/runs/{}/logs", run_id);
        let response = self.post(&path, &LogBody { level, message }).await?;
        Self::expect_success(&path, response).await
    }

    async fn report_completion(&self, run_id: &str, completion: &Completion) -> Result<()> {
        let path = format!("/runs/{}/complete", run_id);
        let response = self.post(&path, &CompletionBody::from(completion)).await?;
        Self::expect_success(&path, response).await
    }
}
