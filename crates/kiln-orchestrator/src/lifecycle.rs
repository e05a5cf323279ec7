//! Task lifecycle policy on top of the coordinator transport
//!
//! - poll: any failure means "no work right now"
//! - run logs: best-effort, awaited in order, mirrored to the local log
//! - completion: logged loudly on failure, never retried

use kiln_coordinator::Coordinator;
use kiln_core::fail_open::fail_open;
use kiln_core::{Completion, KilnError, LogLevel, PollOutcome};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Coordinator access with the worker's failure policy applied
pub struct TaskLifecycle<C: Coordinator> {
    coordinator: Arc<C>,
}

impl<C: Coordinator> Clone for TaskLifecycle<C> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
        }
    }
}

impl<C: Coordinator + 'static> TaskLifecycle<C> {
    pub fn new(coordinator: Arc<C>) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &Arc<C> {
        &self.coordinator
    }

    /// Ask for work. Never fails: transport errors, and schema errors that name no
    /// run, count as no work. An invalid payload for a known run comes back as
    /// [`PollOutcome::Rejected`] so the run can still be completed.
    pub async fn poll(&self) -> PollOutcome {
        match self.coordinator.poll().await {
            Ok(outcome) => outcome,
            Err(e @ KilnError::Protocol(_)) => {
                error!(error = %e, "Coordinator sent an invalid task without a run id, treating as no work");
                PollOutcome::NoWork
            }
            Err(e) => {
                warn!(error = %e, "Poll failed, treating as no work");
                PollOutcome::NoWork
            }
        }
    }

    /// Logger bound to one run
    pub fn run_logger(&self, run_id: impl Into<String>) -> RunLogger<'_> {
        RunLogger::new(self.coordinator.as_ref(), run_id)
    }

    /// Send the terminal report for a run. Returns whether the coordinator accepted it.
    pub async fn complete(&self, run_id: &str, completion: &Completion) -> bool {
        match self.coordinator.report_completion(run_id, completion).await {
            Ok(()) => {
                info!(run_id, status = %completion.status, "Completion reported");
                true
            }
            Err(e) => {
                error!(
                    run_id,
                    status = %completion.status,
                    error = %e,
                    "Failed to report completion; the coordinator will not learn this run's outcome"
                );
                false
            }
        }
    }
}

/// Ordered, best-effort log stream for one run
pub struct RunLogger<'a> {
    coordinator: &'a dyn Coordinator,
    run_id: String,
}

impl<'a> RunLogger<'a> {
    pub fn new(coordinator: &'a dyn Coordinator, run_id: impl Into<String>) -> Self {
        Self {
            coordinator,
            run_id: run_id.into(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Record a line locally and forward it to the run. Delivery failures are swallowed.
    pub async fn log(&self, level: LogLevel, message: impl AsRef<str>) {
        let message = message.as_ref();
        match level {
            LogLevel::Info => info!(run_id = %self.run_id, "{}", message),
            LogLevel::Warn => warn!(run_id = %self.run_id, "{}", message),
            LogLevel::Error => error!(run_id = %self.run_id, "{}", message),
        }
        fail_open("run_log", || {
            self.coordinator.report_log(&self.run_id, level, message)
        })
        .await;
    }

    pub async fn info(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Info, message).await
    }

    pub async fn warn(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Warn, message).await
    }

    pub async fn error(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Error, message).await
    }
}
