//! Unified error types for Kiln

use thiserror::Error;

/// Unified error type for all Kiln operations
#[derive(Error, Debug)]
pub enum KilnError {
    // Startup errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Coordinator errors
    #[error("Coordinator request failed: {0}")]
    Coordinator(String),

    #[error("Coordinator protocol error: {0}")]
    Protocol(String),

    // Workspace errors
    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Git command failed: {0}")]
    Git(String),

    #[error("Invalid repository URL: {0}")]
    InvalidRepoUrl(String),

    #[error("Invalid branch name: {0}")]
    InvalidBranch(String),

    // Synthesis errors
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Provider rate limit: {0}")]
    ApiLimit(String),

    #[error("No changes produced: {0}")]
    NoChanges(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Path validation failed: {0}")]
    PathValidation(String),

    // Publication errors
    #[error("Publication failed: {0}")]
    Publication(String),

    #[error("Hosting service error: {0}")]
    Hosting(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl KilnError {
    /// Whether this error belongs to a single repair-loop attempt (and may be retried
    /// by the loop) rather than to the task as a whole.
    pub fn is_attempt_scoped(&self) -> bool {
        matches!(
            self,
            KilnError::Provider(_)
                | KilnError::ApiLimit(_)
                | KilnError::NoChanges(_)
                | KilnError::Validation(_)
                | KilnError::Timeout(_)
                | KilnError::PathValidation(_)
        )
    }
}

/// Result type alias using KilnError
pub type Result<T> = std::result::Result<T, KilnError>;
