//! Change synthesis: context, generation request, FILE block parsing

use async_trait::async_trait;
use kiln_agent::{parse_file_blocks, CodeProvider};
use kiln_core::{ChangeSet, KilnError, RepoConfig, Result, Task};
use kiln_git::GitExecutor;
use std::path::Path;
use tracing::{info, warn};

use crate::context::build_context;
use crate::prompt::{build_user_prompt, system_prompt};

/// Produces a change set for a task
#[async_trait]
pub trait ChangeSynthesizer: Send + Sync {
    /// Propose whole-file edits for `task` in the checkout at `workspace`.
    ///
    /// `prior_failure` is the diagnostic of the previous attempt, if any. A response
    /// without any usable FILE block is [`KilnError::NoChanges`].
    async fn synthesize(
        &self,
        task: &Task,
        workspace: &Path,
        prior_failure: Option<&str>,
    ) -> Result<ChangeSet>;
}

/// Provider-backed synthesizer
pub struct SynthesisEngine<P: CodeProvider, E: GitExecutor> {
    provider: P,
    git: E,
}

impl<P: CodeProvider, E: GitExecutor> SynthesisEngine<P, E> {
    pub fn new(provider: P, git: E) -> Self {
        Self { provider, git }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }
}

/// Repository config, or defaults when the file is unreadable
pub(crate) fn repo_config_or_default(workspace: &Path) -> RepoConfig {
    RepoConfig::load_or_default(workspace).unwrap_or_else(|e| {
        warn!(error = %e, "Ignoring unreadable repository config");
        RepoConfig::default()
    })
}

#[async_trait]
impl<P: CodeProvider, E: GitExecutor> ChangeSynthesizer for SynthesisEngine<P, E> {
    async fn synthesize(
        &self,
        task: &Task,
        workspace: &Path,
        prior_failure: Option<&str>,
    ) -> Result<ChangeSet> {
        let repo_config = repo_config_or_default(workspace);
        let context = build_context(workspace, task, &repo_config, &self.git).await;
        let prompt = build_user_prompt(task, &context, prior_failure);

        info!(
            task_id = %task.id,
            repair = prior_failure.is_some(),
            prompt_chars = prompt.len(),
            "Requesting changes from provider"
        );

        let response = self.provider.complete(&system_prompt(), &prompt).await?;
        let change_set = parse_file_blocks(&response);

        if change_set.is_empty() {
            return Err(KilnError::NoChanges(
                "provider response contained no FILE blocks".to_string(),
            ));
        }

        info!(files = ?change_set.paths(), "Parsed change set");
        Ok(change_set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_agent::MockProvider;
    use kiln_git::MockGitExecutor;
    use tempfile::TempDir;

    fn task() -> Task {
        Task::new("req-1", "Add health endpoint", "https://example.com/o/r.git", "auto/health")
    }

    #[tokio::test]
    async fn test_parses_provider_response() {
        let temp_dir = TempDir::new().unwrap();
        let provider = MockProvider::new().with_reply("FILE: src/health.ts\nexport const ok = true;\nEND FILE");
        let engine = SynthesisEngine::new(provider.clone(), MockGitExecutor::new());

        let set = engine.synthesize(&task(), temp_dir.path(), None).await.unwrap();
        assert_eq!(set.paths(), vec!["src/health.ts"]);
        assert_eq!(set.edits()[0].content, "export const ok = true;");

        let call = &provider.calls()[0];
        assert!(call.system.contains("FILE:"));
        assert!(call.user.contains("Add health endpoint"));
    }

    #[tokio::test]
    async fn test_prior_failure_reaches_prompt() {
        let temp_dir = TempDir::new().unwrap();
        let provider = MockProvider::new().with_reply("FILE: a.txt\nx\nEND FILE");
        let engine = SynthesisEngine::new(provider.clone(), MockGitExecutor::new());

        engine
            .synthesize(&task(), temp_dir.path(), Some("expected 200, got 404"))
            .await
            .unwrap();
        assert!(provider.calls()[0].user.contains("expected 200, got 404"));
    }

    #[tokio::test]
    async fn test_no_blocks_is_no_changes() {
        let temp_dir = TempDir::new().unwrap();
        let provider = MockProvider::new().with_reply("I think the code is fine as is.");
        let engine = SynthesisEngine::new(provider, MockGitExecutor::new());

        let err = engine.synthesize(&task(), temp_dir.path(), None).await.unwrap_err();
        assert!(matches!(err, KilnError::NoChanges(_)));
        assert!(err.is_attempt_scoped());
    }

    #[tokio::test]
    async fn test_provider_error_propagates() {
        let temp_dir = TempDir::new().unwrap();
        let provider = MockProvider::new().with_error("overloaded");
        let engine = SynthesisEngine::new(provider, MockGitExecutor::new());

        let err = engine.synthesize(&task(), temp_dir.path(), None).await.unwrap_err();
        assert!(matches!(err, KilnError::Provider(_)));
    }
}
