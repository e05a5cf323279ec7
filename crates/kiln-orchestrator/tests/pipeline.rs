//! Worker + pipeline against scripted coordinator, provider, git and hosting

use chrono::Utc;
use kiln_agent::MockProvider;
use kiln_coordinator::MockCoordinator;
use kiln_core::{ClaimedTask, CompletionStatus, Run, Task};
use kiln_git::{MockGitExecutor, MockHostingService, WorkspaceManager};
use kiln_orchestrator::{CommandValidator, Publisher, SynthesisEngine, TaskPipeline, Worker};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const REPO_URL: &str = "https://github.com/acme/api.git";

fn health_task() -> ClaimedTask {
    ClaimedTask {
        task: Task::new("req-1", "Add health endpoint", REPO_URL, "auto/health")
            .with_description("Expose GET /health returning 200 and add a test."),
        run: Run {
            id: "run-1".to_string(),
            started_at: Utc::now(),
        },
    }
}

/// Lay out an existing checkout so `prepare` takes the refresh path
fn seed_checkout(work_dir: &Path, test_command: &str) -> PathBuf {
    let workspace = WorkspaceManager::new(MockGitExecutor::new(), work_dir)
        .workspace_path(REPO_URL)
        .unwrap();
    std::fs::create_dir_all(workspace.join(".git")).unwrap();
    std::fs::create_dir_all(workspace.join(".kiln")).unwrap();
    std::fs::write(
        workspace.join(".kiln/config.toml"),
        format!("test_command = \"{}\"\n", test_command),
    )
    .unwrap();
    workspace
}

struct Harness {
    coordinator: Arc<MockCoordinator>,
    provider: MockProvider,
    git: MockGitExecutor,
    hosting: MockHostingService,
}

fn worker(
    work_dir: &Path,
    harness: &Harness,
) -> Worker<MockCoordinator, impl kiln_orchestrator::TaskExecutor> {
    let pipeline = TaskPipeline::new(
        WorkspaceManager::new(harness.git.clone(), work_dir),
        SynthesisEngine::new(harness.provider.clone(), MockGitExecutor::new()),
        CommandValidator::new(Duration::from_secs(30)),
        Publisher::new(harness.git.clone(), harness.hosting.clone(), "main"),
    )
    .with_max_attempts(3);
    Worker::new(harness.coordinator.clone(), pipeline)
}

#[tokio::test]
async fn test_health_endpoint_task_succeeds_and_opens_pr() {
    let temp_dir = TempDir::new().unwrap();
    let workspace = seed_checkout(temp_dir.path(), "true");

    let harness = Harness {
        coordinator: Arc::new(MockCoordinator::new().with_task(health_task())),
        provider: MockProvider::new()
            .with_reply("FILE: src/health.ts\nexport const ok = true;\nEND FILE"),
        git: MockGitExecutor::new(),
        hosting: MockHostingService::new(),
    };

    assert!(worker(temp_dir.path(), &harness).run_once().await);

    assert_eq!(
        std::fs::read_to_string(workspace.join("src/health.ts")).unwrap(),
        "export const ok = true;"
    );
    assert_eq!(harness.provider.calls().len(), 1);

    let completions = harness.coordinator.completions();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].0, "run-1");
    assert_eq!(completions[0].1.status, CompletionStatus::Success);
    assert!(!completions[0].1.pr_url.as_deref().unwrap().is_empty());

    assert!(harness.git.was_called("checkout -b auto/health"));
    assert!(harness.git.was_called("push -u origin auto/health"));
    assert_eq!(harness.hosting.requests().len(), 1);

    let messages = harness.coordinator.log_messages("run-1");
    assert!(messages
        .iter()
        .any(|m| m.contains("Validation passed after 1 attempt(s)")));
}

#[tokio::test]
async fn test_failing_validation_exhausts_and_never_pushes() {
    let temp_dir = TempDir::new().unwrap();
    seed_checkout(temp_dir.path(), "echo 'expected 200, got 404' && exit 1");

    let harness = Harness {
        coordinator: Arc::new(MockCoordinator::new().with_task(health_task())),
        provider: MockProvider::new()
            .with_reply("FILE: src/health.ts\nexport const ok = false;\nEND FILE"),
        git: MockGitExecutor::new(),
        hosting: MockHostingService::new(),
    };

    worker(temp_dir.path(), &harness).run_once().await;

    let calls = harness.provider.calls();
    assert_eq!(calls.len(), 3);
    assert!(!calls[0].user.contains("PREVIOUS ATTEMPT FAILED"));
    assert!(calls[1].user.contains("expected 200, got 404"));

    let completions = harness.coordinator.completions();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].1.status, CompletionStatus::Failed);
    let message = completions[0].1.error_message.as_deref().unwrap();
    assert!(message.contains("after 3 attempt(s)"));

    assert!(!harness.git.was_called("push"));
    assert!(harness.hosting.requests().is_empty());
}

#[tokio::test]
async fn test_workspace_failure_is_reported_and_worker_continues() {
    let temp_dir = TempDir::new().unwrap();
    seed_checkout(temp_dir.path(), "true");

    let mut second = health_task();
    second.run.id = "run-2".to_string();

    let harness = Harness {
        coordinator: Arc::new(
            MockCoordinator::new()
                .with_task(health_task())
                .with_task(second),
        ),
        provider: MockProvider::new().with_reply("FILE: a.txt\nx\nEND FILE"),
        git: MockGitExecutor::new().with_response(
            "fetch origin --prune",
            kiln_git::GitOutput::failed("fatal: unable to access remote"),
        ),
        hosting: MockHostingService::new(),
    };

    let worker = worker(temp_dir.path(), &harness);
    assert!(worker.run_once().await);
    assert!(worker.run_once().await);
    assert!(!worker.run_once().await);

    let completions = harness.coordinator.completions();
    assert_eq!(completions.len(), 2);
    assert!(completions
        .iter()
        .all(|(_, c)| c.status == CompletionStatus::Failed));
    assert!(completions[0]
        .1
        .error_message
        .as_deref()
        .unwrap()
        .contains("unable to access remote"));
    assert!(harness.provider.calls().is_empty());
}

#[tokio::test]
async fn test_protected_path_is_rejected_before_any_write() {
    let temp_dir = TempDir::new().unwrap();
    let workspace = seed_checkout(temp_dir.path(), "true");

    let harness = Harness {
        coordinator: Arc::new(MockCoordinator::new().with_task(health_task())),
        provider: MockProvider::new().with_reply(
            "FILE: src/ok.ts\nexport {};\nEND FILE\nFILE: .env\nSECRET=1\nEND FILE",
        ),
        git: MockGitExecutor::new(),
        hosting: MockHostingService::new(),
    };

    worker(temp_dir.path(), &harness).run_once().await;

    assert!(!workspace.join("src/ok.ts").exists());
    assert!(!workspace.join(".env").exists());
    let completions = harness.coordinator.completions();
    assert_eq!(completions[0].1.status, CompletionStatus::Failed);
    assert_eq!(harness.provider.calls().len(), 3);
}
