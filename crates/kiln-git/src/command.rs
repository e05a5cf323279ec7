//! Git command execution abstraction

use async_trait::async_trait;
use kiln_core::{KilnError, Result};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::remote::redact;

/// Output from a git command
#[derive(Debug, Clone, Default)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

impl GitOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            success: true,
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            success: false,
        }
    }

    /// Best available explanation of a failure
    pub fn message(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

impl From<Output> for GitOutput {
    fn from(output: Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
        }
    }
}

/// Trait for executing git commands (allows mocking in tests)
#[async_trait]
pub trait GitExecutor: Send + Sync {
    /// Execute `git <args>` with `dir` as the working directory
    async fn exec(&self, dir: &Path, args: &[&str]) -> Result<GitOutput>;
}

/// Real git command executor
///
/// Pins the author/committer identity through the environment so commits never
/// depend on the host's global git config, and disables interactive credential
/// prompts so a bad token fails fast instead of hanging the worker.
#[derive(Clone)]
pub struct GitCommand {
    author_name: String,
    author_email: String,
    secrets: Vec<String>,
}

impl GitCommand {
    pub fn new(author_name: impl Into<String>, author_email: impl Into<String>) -> Self {
        Self {
            author_name: author_name.into(),
            author_email: author_email.into(),
            secrets: Vec::new(),
        }
    }

    /// Scrub this value from all captured output
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        if !secret.is_empty() {
            self.secrets.push(secret);
        }
        self
    }

    fn scrub(&self, text: &str) -> String {
        self.secrets
            .iter()
            .fold(text.to_string(), |acc, secret| redact(&acc, secret))
    }
}

#[async_trait]
impl GitExecutor for GitCommand {
    #[instrument(skip(self, dir, args), fields(dir = %dir.display()))]
    async fn exec(&self, dir: &Path, args: &[&str]) -> Result<GitOutput> {
        debug!("Executing git {}", self.scrub(&args.join(" ")));

        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_AUTHOR_NAME", &self.author_name)
            .env("GIT_AUTHOR_EMAIL", &self.author_email)
            .env("GIT_COMMITTER_NAME", &self.author_name)
            .env("GIT_COMMITTER_EMAIL", &self.author_email)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| KilnError::Git(format!("Failed to execute git: {}", e)))?;

        let mut git_output = GitOutput::from(output);
        git_output.stdout = self.scrub(&git_output.stdout);
        git_output.stderr = self.scrub(&git_output.stderr);

        if !git_output.success {
            debug!("git command failed: {}", git_output.stderr.trim());
        }

        Ok(git_output)
    }
}

/// Mock git executor for testing
///
/// Responses are keyed by the space-joined argument list. When several responses
/// are queued for one key they are returned in order and the last one repeats.
/// Commands without a scripted response succeed with empty output.
#[derive(Clone, Default)]
pub struct MockGitExecutor {
    responses: Arc<Mutex<HashMap<String, VecDeque<GitOutput>>>>,
    calls: Arc<Mutex<Vec<(PathBuf, String)>>>,
}

impl MockGitExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(self, command: &str, output: GitOutput) -> Self {
        self.responses
            .lock()
            .unwrap()
            .entry(command.to_string())
            .or_default()
            .push_back(output);
        self
    }

    /// Every command executed so far, as space-joined arguments
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, args)| args.clone())
            .collect()
    }

    /// Working directories paired with the commands executed in them
    pub fn calls_with_dirs(&self) -> Vec<(PathBuf, String)> {
        self.calls.lock().unwrap().clone()
    }

    /// Whether a command starting with `prefix` was executed
    pub fn was_called(&self, prefix: &str) -> bool {
        self.calls().iter().any(|c| c.starts_with(prefix))
    }
}

#[async_trait]
impl GitExecutor for MockGitExecutor {
    async fn exec(&self, dir: &Path, args: &[&str]) -> Result<GitOutput> {
        let key = args.join(" ");
        self.calls
            .lock()
            .unwrap()
            .push((dir.to_path_buf(), key.clone()));

        let mut responses = self.responses.lock().unwrap();
        let output = match responses.get_mut(&key) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
            Some(queue) => queue.front().cloned().unwrap_or_else(|| GitOutput::ok("")),
            None => GitOutput::ok(""),
        };
        Ok(output)
    }
}
