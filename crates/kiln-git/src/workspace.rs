//! Workspace management: one checkout per repository, one branch per task

use kiln_core::{KilnError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::command::GitExecutor;
use crate::remote::{authenticated_url, redact, RepoRef};

/// Ensures an up-to-date, branch-isolated checkout exists for a task
pub struct WorkspaceManager<E: GitExecutor> {
    executor: E,
    work_dir: PathBuf,
    token: Option<String>,
    fallback_branch: String,
}

impl<E: GitExecutor> WorkspaceManager<E> {
    pub fn new(executor: E, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            executor,
            work_dir: work_dir.into(),
            token: None,
            fallback_branch: "main".to_string(),
        }
    }

    /// Hosting token used to authenticate https clones
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.token = (!token.is_empty()).then_some(token);
        self
    }

    /// Branch assumed to be the upstream default when `origin/HEAD` is unknown
    pub fn with_fallback_branch(mut self, branch: impl Into<String>) -> Self {
        self.fallback_branch = branch.into();
        self
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Checkout location for a repository URL
    pub fn workspace_path(&self, repo_url: &str) -> Result<PathBuf> {
        let repo = RepoRef::parse(repo_url)?;
        Ok(self.work_dir.join(repo.workspace_dir_name()))
    }

    /// Prepare a checkout of `repo_url` with `branch_name` checked out.
    ///
    /// An existing checkout is fetched and hard-reset to the upstream default branch,
    /// otherwise the repository is cloned fresh. The branch is then created, or checked
    /// out if it already exists, so calling this twice with the same arguments is safe.
    pub async fn prepare(&self, repo_url: &str, branch_name: &str) -> Result<PathBuf> {
        validate_branch_name(branch_name)?;
        let path = self.workspace_path(repo_url)?;

        std::fs::create_dir_all(&self.work_dir).map_err(|e| {
            KilnError::Workspace(format!(
                "Failed to create work dir {}: {}",
                self.work_dir.display(),
                e
            ))
        })?;

        if path.join(".git").exists() {
            info!(path = %path.display(), "Refreshing existing checkout");
            self.refresh(&path).await?;
        } else {
            if path.exists() {
                warn!(path = %path.display(), "Removing incomplete checkout before cloning");
                std::fs::remove_dir_all(&path).map_err(|e| {
                    KilnError::Workspace(format!(
                        "Failed to remove stale directory {}: {}",
                        path.display(),
                        e
                    ))
                })?;
            }
            info!(path = %path.display(), "Cloning repository");
            self.clone_into(repo_url, &path).await?;
        }

        self.acquire_branch(&path, branch_name).await?;
        info!(path = %path.display(), branch = branch_name, "Workspace ready");
        Ok(path)
    }

    async fn clone_into(&self, repo_url: &str, path: &Path) -> Result<()> {
        let url = match &self.token {
            Some(token) => authenticated_url(repo_url, token),
            None => repo_url.to_string(),
        };
        let target = path.to_str().ok_or_else(|| {
            KilnError::Workspace("workspace path contains non-UTF-8 characters".into())
        })?;

        let output = self
            .executor
            .exec(&self.work_dir, &["clone", &url, target])
            .await?;

        if !output.success {
            return Err(KilnError::Workspace(format!(
                "Failed to clone {}: {}",
                repo_url,
                self.scrub(&output.message())
            )));
        }
        Ok(())
    }

    async fn refresh(&self, path: &Path) -> Result<()> {
        let output = self.executor.exec(path, &["fetch", "origin", "--prune"]).await?;
        if !output.success {
            return Err(KilnError::Workspace(format!(
                "Failed to fetch origin: {}",
                self.scrub(&output.message())
            )));
        }

        let default_branch = self.default_branch(path).await;
        debug!(branch = %default_branch, "Resetting to upstream default branch");

        let upstream = format!("origin/{}", default_branch);
        let steps: [&[&str]; 3] = [
            &["checkout", "-f", default_branch.as_str()],
            &["reset", "--hard", upstream.as_str()],
            &["clean", "-fd"],
        ];
        for args in steps {
            let output = self.executor.exec(path, args).await?;
            if !output.success {
                return Err(KilnError::Workspace(format!(
                    "git {} failed: {}",
                    args.join(" "),
                    self.scrub(&output.message())
                )));
            }
        }
        Ok(())
    }

    async fn default_branch(&self, path: &Path) -> String {
        match self
            .executor
            .exec(path, &["symbolic-ref", "--short", "refs/remotes/origin/HEAD"])
            .await
        {
            Ok(output) if output.success => {
                let name = output.stdout.trim();
                let name = name.strip_prefix("origin/").unwrap_or(name);
                if name.is_empty() {
                    self.fallback_branch.clone()
                } else {
                    name.to_string()
                }
            }
            _ => self.fallback_branch.clone(),
        }
    }

    async fn acquire_branch(&self, path: &Path, branch_name: &str) -> Result<()> {
        let output = self
            .executor
            .exec(path, &["checkout", "-b", branch_name])
            .await?;
        if output.success {
            debug!(branch = branch_name, "Created branch");
            return Ok(());
        }

        if !output.message().contains("already exists") {
            return Err(KilnError::Workspace(format!(
                "Failed to create branch {}: {}",
                branch_name,
                output.message()
            )));
        }

        debug!(branch = branch_name, "Branch already exists, reusing");
        let output = self.executor.exec(path, &["checkout", branch_name]).await?;
        if !output.success {
            return Err(KilnError::Workspace(format!(
                "Failed to check out existing branch {}: {}",
                branch_name,
                output.message()
            )));
        }
        Ok(())
    }

    fn scrub(&self, text: &str) -> String {
        match &self.token {
            Some(token) => redact(text, token),
            None => text.to_string(),
        }
    }
}

/// Reject branch names git would refuse or misinterpret as options
pub fn validate_branch_name(name: &str) -> Result<()> {
    const FORBIDDEN: &[char] = &['~', '^', ':', '?', '*', '[', '\\'];

    let invalid = name.is_empty()
        || name.starts_with('-')
        || name.starts_with('/')
        || name.ends_with('/')
        || name.ends_with(".lock")
        || name.contains("..")
        || name.contains("@{")
        || name.chars().any(|c| c.is_whitespace() || c.is_control() || FORBIDDEN.contains(&c));

    if invalid {
        Err(KilnError::InvalidBranch(format!("'{}'", name)))
    } else {
        Ok(())
    }
}
