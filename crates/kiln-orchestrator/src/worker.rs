//! Worker driver: poll, execute, report, repeat
//!
//! One task at a time. Everything a task does runs inside a boundary that turns
//! errors and panics into a FAILED completion, so the loop only stops on shutdown.

use futures::FutureExt;
use kiln_coordinator::Coordinator;
use kiln_core::{ClaimedTask, Completion, PollOutcome};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::lifecycle::TaskLifecycle;
use crate::liveness::spawn_liveness;
use crate::pipeline::TaskExecutor;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Long-running task worker
pub struct Worker<C: Coordinator + 'static, X: TaskExecutor> {
    lifecycle: TaskLifecycle<C>,
    executor: X,
    poll_interval: Duration,
    heartbeat_interval: Duration,
    current_run: watch::Sender<Option<String>>,
    cancel: CancellationToken,
}

impl<C: Coordinator + 'static, X: TaskExecutor> Worker<C, X> {
    pub fn new(coordinator: Arc<C>, executor: X) -> Self {
        let (current_run, _) = watch::channel(None);
        Self {
            lifecycle: TaskLifecycle::new(coordinator),
            executor,
            poll_interval: DEFAULT_POLL_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            current_run,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Token that stops the worker. Cancelling it cuts an idle sleep short; a task
    /// already executing still runs to completion.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run id of the task currently executing, if any
    pub fn current_run(&self) -> Option<String> {
        self.current_run.borrow().clone()
    }

    /// Poll and execute until cancelled. Heartbeats run alongside for the whole call.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs_f64(),
            heartbeat_interval_secs = self.heartbeat_interval.as_secs_f64(),
            "Worker started"
        );

        let liveness_cancel = self.cancel.child_token();
        let liveness = spawn_liveness(
            self.lifecycle.coordinator().clone(),
            self.heartbeat_interval,
            self.current_run.subscribe(),
            liveness_cancel.clone(),
        );

        while !self.cancel.is_cancelled() {
            let worked = self.run_once().await;
            if self.cancel.is_cancelled() {
                break;
            }
            if !worked {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }

        liveness_cancel.cancel();
        if let Err(e) = liveness.await {
            warn!(error = %e, "Liveness reporter ended abnormally");
        }
        info!("Worker stopped");
    }

    /// One poll-and-execute cycle. Returns whether a task was claimed.
    pub async fn run_once(&self) -> bool {
        match self.lifecycle.poll().await {
            PollOutcome::NoWork => {
                debug!("No work available");
                false
            }
            PollOutcome::Claimed(claimed) => {
                self.execute_claimed(claimed).await;
                true
            }
            PollOutcome::Rejected { run_id, reason } => {
                self.reject_claim(&run_id, &reason).await;
                true
            }
        }
    }

    /// Close out a run whose task payload could not be used
    async fn reject_claim(&self, run_id: &str, reason: &str) -> Completion {
        error!(run_id, reason, "Coordinator sent an invalid task");
        let message = format!("Invalid task payload: {}", reason);
        self.lifecycle.run_logger(run_id).error(&message).await;

        let completion = Completion::failed(message);
        self.lifecycle.complete(run_id, &completion).await;
        completion
    }

    async fn execute_claimed(&self, claimed: ClaimedTask) -> Completion {
        let run_id = claimed.run.id.clone();
        info!(
            task_id = %claimed.task.id,
            run_id = %run_id,
            priority = %claimed.task.priority,
            "Claimed task: {}",
            claimed.task.title
        );
        self.current_run.send_replace(Some(run_id.clone()));

        let log = self.lifecycle.run_logger(run_id.clone());
        log.info(format!("Starting task: {}", claimed.task.title))
            .await;

        let outcome = AssertUnwindSafe(self.executor.execute(&claimed, &log))
            .catch_unwind()
            .await;

        let completion = match outcome {
            Ok(Ok(pr_url)) => Completion::success(pr_url),
            Ok(Err(e)) => {
                log.error(format!("Task failed: {}", e)).await;
                Completion::failed(e.to_string())
            }
            Err(payload) => {
                let message = format!("task panicked: {}", panic_message(payload.as_ref()));
                error!(run_id = %run_id, "{}", message);
                log.error(&message).await;
                Completion::failed(message)
            }
        };

        self.current_run.send_replace(None);
        self.lifecycle.complete(&run_id, &completion).await;
        completion
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use kiln_coordinator::MockCoordinator;
    use kiln_core::{CompletionStatus, KilnError, Result, Run, Task};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::lifecycle::RunLogger;

    fn claimed(run_id: &str) -> ClaimedTask {
        ClaimedTask {
            task: Task::new(
                format!("req-{}", run_id),
                "Add health endpoint",
                "https://github.com/acme/api.git",
                "auto/health",
            ),
            run: Run {
                id: run_id.to_string(),
                started_at: Utc::now(),
            },
        }
    }

    enum Behaviour {
        Succeed,
        Fail,
        Panic,
    }

    struct ScriptedExecutor {
        behaviour: Behaviour,
        calls: AtomicUsize,
    }

    impl ScriptedExecutor {
        fn new(behaviour: Behaviour) -> Self {
            Self {
                behaviour,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl TaskExecutor for ScriptedExecutor {
        async fn execute(&self, claimed: &ClaimedTask, log: &RunLogger<'_>) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            log.info("working").await;
            match self.behaviour {
                Behaviour::Succeed => Ok(format!("https://github.com/acme/api/pull/{}", claimed.run.id)),
                Behaviour::Fail => Err(KilnError::Workspace("clone failed".into())),
                Behaviour::Panic => panic!("index out of bounds"),
            }
        }
    }

    #[tokio::test]
    async fn test_no_work_returns_false() {
        let coordinator = Arc::new(MockCoordinator::new().with_no_work());
        let worker = Worker::new(coordinator.clone(), ScriptedExecutor::new(Behaviour::Succeed));
        assert!(!worker.run_once().await);
        assert!(coordinator.completions().is_empty());
    }

    #[tokio::test]
    async fn test_success_reports_pr_url() {
        let coordinator = Arc::new(MockCoordinator::new().with_task(claimed("run-1")));
        let worker = Worker::new(coordinator.clone(), ScriptedExecutor::new(Behaviour::Succeed));

        assert!(worker.run_once().await);
        let completions = coordinator.completions();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].0, "run-1");
        assert!(completions[0].1.is_success());
        assert!(completions[0].1.pr_url.as_deref().unwrap().ends_with("/pull/run-1"));
        assert_eq!(worker.current_run(), None);
    }

    #[tokio::test]
    async fn test_error_becomes_single_failed_completion() {
        let coordinator = Arc::new(MockCoordinator::new().with_task(claimed("run-1")));
        let worker = Worker::new(coordinator.clone(), ScriptedExecutor::new(Behaviour::Fail));

        worker.run_once().await;
        let completions = coordinator.completions();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].1.status, CompletionStatus::Failed);
        assert!(completions[0]
            .1
            .error_message
            .as_deref()
            .unwrap()
            .contains("clone failed"));
    }

    #[tokio::test]
    async fn test_panic_becomes_failed_completion_and_worker_continues() {
        let coordinator = Arc::new(
            MockCoordinator::new()
                .with_task(claimed("run-1"))
                .with_task(claimed("run-2")),
        );
        let executor = ScriptedExecutor::new(Behaviour::Panic);
        let worker = Worker::new(coordinator.clone(), executor);

        assert!(worker.run_once().await);
        assert!(worker.run_once().await);

        let completions = coordinator.completions();
        assert_eq!(completions.len(), 2);
        for (_, completion) in &completions {
            assert_eq!(completion.status, CompletionStatus::Failed);
            assert!(completion
                .error_message
                .as_deref()
                .unwrap()
                .contains("index out of bounds"));
        }
        assert_eq!(worker.current_run(), None);
    }

    #[tokio::test]
    async fn test_rejected_claim_gets_failed_completion() {
        let coordinator = Arc::new(
            MockCoordinator::new()
                .with_rejected_claim("run-42", "poll response missing required field 'request.repoUrl'")
                .with_task(claimed("run-43")),
        );
        let executor = ScriptedExecutor::new(Behaviour::Succeed);
        let worker = Worker::new(coordinator.clone(), executor);

        assert!(worker.run_once().await);
        assert_eq!(worker.executor.calls.load(Ordering::SeqCst), 0);

        let completions = coordinator.completions();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].0, "run-42");
        assert_eq!(completions[0].1.status, CompletionStatus::Failed);
        assert!(completions[0]
            .1
            .error_message
            .as_deref()
            .unwrap()
            .contains("request.repoUrl"));
        assert!(!coordinator.log_messages("run-42").is_empty());

        assert!(worker.run_once().await);
        assert_eq!(coordinator.completions().len(), 2);
        assert!(coordinator.completions()[1].1.is_success());
    }

    #[tokio::test]
    async fn test_log_failures_do_not_change_outcome() {
        let coordinator = Arc::new(
            MockCoordinator::new()
                .with_task(claimed("run-1"))
                .failing_logs(),
        );
        let worker = Worker::new(coordinator.clone(), ScriptedExecutor::new(Behaviour::Succeed));

        worker.run_once().await;
        assert!(coordinator.completions()[0].1.is_success());
    }

    #[tokio::test]
    async fn test_run_keeps_polling_and_stops_on_cancel() {
        let coordinator = Arc::new(MockCoordinator::new());
        let worker = Arc::new(
            Worker::new(coordinator.clone(), ScriptedExecutor::new(Behaviour::Succeed))
                .with_poll_interval(Duration::from_millis(10))
                .with_heartbeat_interval(Duration::from_secs(60)),
        );
        let token = worker.cancellation_token();

        let handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run().await }
        });

        for _ in 0..200 {
            if coordinator.poll_count() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(coordinator.poll_count() >= 3);

        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_cuts_idle_sleep_short() {
        let coordinator = Arc::new(MockCoordinator::new());
        let worker = Arc::new(
            Worker::new(coordinator.clone(), ScriptedExecutor::new(Behaviour::Succeed))
                .with_poll_interval(Duration::from_secs(3600)),
        );
        let token = worker.cancellation_token();

        let handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run().await }
        });
        for _ in 0..200 {
            if coordinator.poll_count() >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("idle sleep was not interrupted")
            .unwrap();
        assert_eq!(coordinator.poll_count(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_failures_do_not_affect_task() {
        let coordinator = Arc::new(
            MockCoordinator::new()
                .with_task(claimed("run-1"))
                .failing_heartbeats(),
        );
        let worker = Arc::new(
            Worker::new(coordinator.clone(), ScriptedExecutor::new(Behaviour::Succeed))
                .with_poll_interval(Duration::from_millis(10))
                .with_heartbeat_interval(Duration::from_millis(5)),
        );
        let token = worker.cancellation_token();
        let handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run().await }
        });

        for _ in 0..200 {
            if !coordinator.completions().is_empty() && !coordinator.heartbeats().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        token.cancel();
        handle.await.unwrap();

        let completions = coordinator.completions();
        assert_eq!(completions.len(), 1);
        assert!(completions[0].1.is_success());
        assert!(!coordinator.heartbeats().is_empty());
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(boxed.as_ref()), "static str");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic payload");
    }
}
