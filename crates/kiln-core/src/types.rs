//! Core type definitions for Kiln

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Task priority hint supplied by the coordinator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical = 0,
    High = 1,
    #[default]
    Medium = 2,
    Low = 3,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "critical" | "urgent" | "0" => Ok(Self::Critical),
            "high" | "1" => Ok(Self::High),
            "medium" | "normal" | "2" => Ok(Self::Medium),
            "low" | "3" => Ok(Self::Low),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}

/// One unit of work claimed from the coordinator. Read-only for the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Coordinator request id
    pub id: String,
    /// Id of the backlog item this request was created from
    pub todo_id: String,
    pub title: String,
    pub description: Option<String>,
    /// Target repository location
    pub repo_url: String,
    /// Branch to create (or reuse) for the change
    pub branch_name: String,
    pub priority: Priority,
}

impl Task {
    /// Create a task with the required fields and no description
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        repo_url: impl Into<String>,
        branch_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            todo_id: String::new(),
            title: title.into(),
            description: None,
            repo_url: repo_url.into(),
            branch_name: branch_name.into(),
            priority: Priority::default(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Description text, or an empty string when the task has none
    pub fn description_text(&self) -> &str {
        self.description.as_deref().unwrap_or("")
    }
}

/// Execution record paired 1:1 with a claimed task for one worker attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub started_at: DateTime<Utc>,
}

/// A validated, claimed unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedTask {
    pub task: Task,
    pub run: Run,
}

/// Result of asking the coordinator for work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing claimable right now; wait and retry
    NoWork,
    Claimed(ClaimedTask),
    /// The coordinator opened run `run_id` but the task payload failed validation.
    /// The run still needs a FAILED completion.
    Rejected { run_id: String, reason: String },
}

impl PollOutcome {
    pub fn is_no_work(&self) -> bool {
        matches!(self, PollOutcome::NoWork)
    }
}

/// Severity of a run log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Terminal status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CompletionStatus {
    Success,
    Failed,
}

impl std::fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Terminal report for a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub status: CompletionStatus,
    pub pr_url: Option<String>,
    pub error_message: Option<String>,
}

impl Completion {
    pub fn success(pr_url: impl Into<String>) -> Self {
        Self {
            status: CompletionStatus::Success,
            pr_url: Some(pr_url.into()),
            error_message: None,
        }
    }

    /// A failed completion. An empty message is replaced so the report is never blank.
    pub fn failed(message: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.trim().is_empty() {
            "task failed without an error message".to_string()
        } else {
            message
        };
        Self {
            status: CompletionStatus::Failed,
            pr_url: None,
            error_message: Some(message),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CompletionStatus::Success
    }
}

/// A single whole-file edit: the full replacement content for a repository-relative path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEdit {
    pub path: String,
    pub content: String,
}

impl FileEdit {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// Ordered collection of whole-file edits proposed by one synthesis attempt
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    edits: Vec<FileEdit>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an edit. A later edit for a path already present replaces its content
    /// but keeps the original position.
    pub fn push(&mut self, edit: FileEdit) {
        if let Some(existing) = self.edits.iter_mut().find(|e| e.path == edit.path) {
            existing.content = edit.content;
        } else {
            self.edits.push(edit);
        }
    }

    pub fn edits(&self) -> &[FileEdit] {
        &self.edits
    }

    pub fn paths(&self) -> Vec<&str> {
        self.edits.iter().map(|e| e.path.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.edits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }
}

impl FromIterator<FileEdit> for ChangeSet {
    fn from_iter<I: IntoIterator<Item = FileEdit>>(iter: I) -> Self {
        let mut set = ChangeSet::new();
        for edit in iter {
            set.push(edit);
        }
        set
    }
}

impl IntoIterator for ChangeSet {
    type Item = FileEdit;
    type IntoIter = std::vec::IntoIter<FileEdit>;

    fn into_iter(self) -> Self::IntoIter {
        self.edits.into_iter()
    }
}

/// Result of one repair-loop iteration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptOutcome {
    /// 1-based attempt number
    pub attempt: usize,
    pub success: bool,
    /// Edits applied in this attempt (empty when synthesis produced nothing)
    pub change_set: ChangeSet,
    /// Test/build output or synthesis error on failure
    pub diagnostic: Option<String>,
}

/// Outcome of running the project's verification command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub passed: bool,
    /// The command that was run, if any
    pub command: Option<String>,
    pub diagnostic: Option<String>,
}

impl ValidationReport {
    pub fn passed(command: impl Into<String>) -> Self {
        Self {
            passed: true,
            command: Some(command.into()),
            diagnostic: None,
        }
    }

    pub fn failed(command: Option<String>, diagnostic: impl Into<String>) -> Self {
        Self {
            passed: false,
            command,
            diagnostic: Some(diagnostic.into()),
        }
    }
}
