//! Publication: commit the validated change, push the task branch, open a pull request

use kiln_core::{ClaimedTask, KilnError, Result};
use kiln_git::{GitExecutor, HostingService, PullRequestRequest, RepoRef};
use std::path::Path;
use tracing::{info, instrument};

/// Commits, pushes and opens pull requests for validated changes
pub struct Publisher<E: GitExecutor, H: HostingService> {
    git: E,
    hosting: H,
    base_branch: String,
}

impl<E: GitExecutor, H: HostingService> Publisher<E, H> {
    pub fn new(git: E, hosting: H, base_branch: impl Into<String>) -> Self {
        Self {
            git,
            hosting,
            base_branch: base_branch.into(),
        }
    }

    pub fn hosting(&self) -> &H {
        &self.hosting
    }

    /// Publish the working tree at `workspace` and return the pull request URL.
    ///
    /// Only called after validation passed.
    #[instrument(skip(self, workspace, claimed), fields(task_id = %claimed.task.id))]
    pub async fn publish(
        &self,
        workspace: &Path,
        claimed: &ClaimedTask,
        attempts: usize,
    ) -> Result<String> {
        let task = &claimed.task;

        self.git_step(workspace, &["add", "-A"], "stage changes").await?;

        // A re-run of a task whose earlier run already committed can validate a tree
        // identical to the branch tip
        if self.has_staged_changes(workspace).await? {
            let message = commit_message(claimed);
            self.git_step(workspace, &["commit", "-m", message.as_str()], "commit")
                .await?;
        } else {
            info!(branch = %task.branch_name, "Nothing new to commit, publishing existing branch");
        }

        self.git_step(
            workspace,
            &["push", "-u", "origin", task.branch_name.as_str()],
            "push",
        )
        .await?;
        info!(branch = %task.branch_name, "Pushed task branch");

        let repo = RepoRef::parse(&task.repo_url)?;
        let request = PullRequestRequest {
            owner: repo.owner,
            repo: repo.name,
            head: task.branch_name.clone(),
            base: self.base_branch.clone(),
            title: task.title.clone(),
            body: pull_request_body(claimed, attempts),
        };

        let url = self.hosting.create_pull_request(&request).await?;
        info!(pr_url = %url, "Pull request ready");
        Ok(url)
    }

    async fn has_staged_changes(&self, workspace: &Path) -> Result<bool> {
        let output = self.git.exec(workspace, &["status", "--porcelain"]).await?;
        if !output.success {
            return Err(KilnError::Publication(format!(
                "git status failed: {}",
                output.message()
            )));
        }
        Ok(!output.stdout.trim().is_empty())
    }

    async fn git_step(&self, workspace: &Path, args: &[&str], what: &str) -> Result<()> {
        let output = self.git.exec(workspace, args).await?;
        if !output.success {
            return Err(KilnError::Publication(format!(
                "git {} failed: {}",
                what,
                output.message()
            )));
        }
        Ok(())
    }
}

/// Commit message: task title plus trailers linking back to the task and run
pub fn commit_message(claimed: &ClaimedTask) -> String {
    format!(
        "{}\n\nKiln-Task: {}\nKiln-Run: {}",
        claimed.task.title.trim(),
        claimed.task.id,
        claimed.run.id
    )
}

pub fn pull_request_body(claimed: &ClaimedTask, attempts: usize) -> String {
    let mut body = String::new();
    let description = claimed.task.description_text().trim();
    if !description.is_empty() {
        body.push_str(description);
        body.push_str("\n\n---\n\n");
    }
    body.push_str(&format!(
        "The project's verification command passed after {} attempt(s).\n\n",
        attempts
    ));
    body.push_str("This change was produced autonomously by Kiln.\n\n");
    body.push_str(&format!(
        "- Task: `{}`\n- Run: `{}`\n",
        claimed.task.id, claimed.run.id
    ));
    body
}
