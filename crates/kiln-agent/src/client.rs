//! Generative provider client
//!
//! Every generation request is stateless: the system instruction and the full user
//! prompt are sent fresh each time. Repair context travels inside the prompt, never
//! as conversation history.

use crate::circuit_breaker::CircuitBreaker;
use crate::types::{AnthropicMessage, AnthropicRequest, AnthropicResponse, Model};
use async_trait::async_trait;
use kiln_core::{KilnError, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: usize = 16000;

const MAX_RETRIES: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_secs(30);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

// Shared by every provider instance in the process
static CIRCUIT_BREAKER: OnceLock<Arc<CircuitBreaker>> = OnceLock::new();

fn shared_circuit_breaker() -> Arc<CircuitBreaker> {
    CIRCUIT_BREAKER
        .get_or_init(|| Arc::new(CircuitBreaker::default()))
        .clone()
}

/// Seam for the text-generation backend
#[async_trait]
pub trait CodeProvider: Send + Sync {
    /// Generate a completion for `user` under the `system` instruction
    async fn complete(&self, system: &str, user: &str) -> Result<String>;
}

/// Anthropic Messages API provider
#[derive(Clone)]
pub struct AnthropicProvider {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    model: Model,
    max_tokens: usize,
    initial_backoff: Duration,
    breaker: Arc<CircuitBreaker>,
}

impl std::fmt::Debug for AnthropicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicProvider")
            .field("api_url", &self.api_url)
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .finish_non_exhaustive()
    }
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>, model: Model) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: ANTHROPIC_API_URL.to_string(),
            api_key: api_key.into(),
            model,
            max_tokens: DEFAULT_MAX_TOKENS,
            initial_backoff: INITIAL_BACKOFF,
            breaker: shared_circuit_breaker(),
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Override the Messages endpoint (proxies, tests)
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    /// Starting back-off used when the server gives no `retry-after`
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Use a dedicated breaker instead of the process-wide one
    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn model(&self) -> Model {
        self.model
    }
}

#[async_trait]
impl CodeProvider for AnthropicProvider {
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        if !self.breaker.can_execute() {
            return Err(KilnError::ApiLimit(format!(
                "Circuit breaker is OPEN after repeated provider failures. Retry in {}s.",
                self.breaker.time_until_retry().as_secs()
            )));
        }

        let request = AnthropicRequest {
            model: self.model.api_name().to_string(),
            max_tokens: self.max_tokens,
            system: (!system.is_empty()).then(|| system.to_string()),
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: user.to_string(),
            }],
        };

        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            tracing::debug!(model = %self.model, attempt = retries + 1, "Sending generation request");

            let response = self
                .http
                .post(&self.api_url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&request)
                .send()
                .await
                .map_err(|e| KilnError::Provider(format!("Failed to send request: {}", e)))?;

            let status = response.status();

            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                retries += 1;
                if retries > MAX_RETRIES {
                    let text = response.text().await.unwrap_or_default();
                    return Err(KilnError::ApiLimit(format!(
                        "Rate limit exceeded after {} retries: {}",
                        MAX_RETRIES, text
                    )));
                }

                let wait = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .map(Duration::from_secs)
                    .unwrap_or(backoff);

                tracing::warn!(
                    wait_secs = wait.as_secs(),
                    retry = retries,
                    max = MAX_RETRIES,
                    "Provider rate limited (429), backing off"
                );
                tokio::time::sleep(wait).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }

            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();

                if status.is_server_error() && retries < MAX_RETRIES {
                    retries += 1;
                    tracing::warn!(
                        %status,
                        wait_secs = backoff.as_secs(),
                        retry = retries,
                        max = MAX_RETRIES,
                        "Provider server error, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }

                self.breaker.record_failure();
                tracing::error!(
                    failures = self.breaker.failure_count(),
                    "Provider call failed, recorded against circuit breaker"
                );
                return Err(KilnError::Provider(format!(
                    "Provider API error {}: {}",
                    status, text
                )));
            }

            let parsed: AnthropicResponse = response
                .json()
                .await
                .map_err(|e| KilnError::Provider(format!("Failed to parse response: {}", e)))?;

            self.breaker.record_success();

            let text = parsed.text();
            match &parsed.usage {
                Some(usage) => tracing::info!(
                    chars = text.len(),
                    input_tokens = usage.input_tokens,
                    output_tokens = usage.output_tokens,
                    "Generation complete"
                ),
                None => tracing::info!(chars = text.len(), "Generation complete"),
            }

            if text.trim().is_empty() {
                return Err(KilnError::Provider("Provider returned no text".to_string()));
            }
            return Ok(text);
        }
    }
}

/// A prompt pair received by [`MockProvider`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    pub system: String,
    pub user: String,
}

/// Scripted provider for tests
///
/// Replies are consumed in order; the last one repeats once the queue runs dry.
#[derive(Clone, Default)]
pub struct MockProvider {
    replies: Arc<Mutex<VecDeque<std::result::Result<String, String>>>>,
    calls: Arc<Mutex<Vec<ProviderCall>>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply(self, text: impl Into<String>) -> Self {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(Ok(text.into()));
        }
        self
    }

    /// Queue a provider error
    pub fn with_error(self, message: impl Into<String>) -> Self {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(Err(message.into()));
        }
        self
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CodeProvider for MockProvider {
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(ProviderCall {
                system: system.to_string(),
                user: user.to_string(),
            });
        }

        let reply = match self.replies.lock() {
            Ok(mut replies) if replies.len() > 1 => replies.pop_front(),
            Ok(replies) => replies.front().cloned(),
            Err(_) => None,
        };

        match reply {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => Err(KilnError::Provider(message)),
            None => Err(KilnError::Provider("no scripted reply".to_string())),
        }
    }
}
