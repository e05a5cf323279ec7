//! One task, start to finish: workspace, repair loop, publication

use async_trait::async_trait;
use kiln_core::{ClaimedTask, KilnError, Result};
use kiln_git::{GitExecutor, HostingService, WorkspaceManager};

use crate::lifecycle::RunLogger;
use crate::publish::Publisher;
use crate::repair_loop::{RepairLoop, DEFAULT_MAX_ATTEMPTS};
use crate::synthesis::ChangeSynthesizer;
use crate::validation::ChangeValidator;

/// Executes a claimed task and returns the pull request URL
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, claimed: &ClaimedTask, log: &RunLogger<'_>) -> Result<String>;
}

/// Production executor
pub struct TaskPipeline<E, S, V, H>
where
    E: GitExecutor,
    S: ChangeSynthesizer,
    V: ChangeValidator,
    H: HostingService,
{
    workspaces: WorkspaceManager<E>,
    synthesizer: S,
    validator: V,
    publisher: Publisher<E, H>,
    max_attempts: usize,
}

impl<E, S, V, H> TaskPipeline<E, S, V, H>
where
    E: GitExecutor,
    S: ChangeSynthesizer,
    V: ChangeValidator,
    H: HostingService,
{
    pub fn new(
        workspaces: WorkspaceManager<E>,
        synthesizer: S,
        validator: V,
        publisher: Publisher<E, H>,
    ) -> Self {
        Self {
            workspaces,
            synthesizer,
            validator,
            publisher,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }
}

#[async_trait]
impl<E, S, V, H> TaskExecutor for TaskPipeline<E, S, V, H>
where
    E: GitExecutor,
    S: ChangeSynthesizer,
    V: ChangeValidator,
    H: HostingService,
{
    async fn execute(&self, claimed: &ClaimedTask, log: &RunLogger<'_>) -> Result<String> {
        let task = &claimed.task;

        log.info(format!(
            "Preparing workspace for {} on branch {}",
            task.repo_url, task.branch_name
        ))
        .await;
        let workspace = self
            .workspaces
            .prepare(&task.repo_url, &task.branch_name)
            .await?;
        log.info(format!("Workspace ready at {}", workspace.display()))
            .await;

        let report = RepairLoop::new(&self.synthesizer, &self.validator, self.max_attempts)
            .run(task, &workspace, log)
            .await?;

        if !report.succeeded() {
            return Err(KilnError::Validation(format!(
                "no passing change after {} attempt(s): {}",
                report.attempts(),
                report.diagnostic().unwrap_or("no diagnostic")
            )));
        }

        log.info("Publishing validated change").await;
        let url = self
            .publisher
            .publish(&workspace, claimed, report.attempts())
            .await?;
        log.info(format!("Opened pull request {}", url)).await;

        Ok(url)
    }
}
