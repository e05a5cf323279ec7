//! In-memory coordinator for tests

use async_trait::async_trait;
use kiln_core::{ClaimedTask, Completion, KilnError, LogLevel, PollOutcome, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct State {
    polls: VecDeque<std::result::Result<PollOutcome, String>>,
    poll_count: usize,
    heartbeats: Vec<Option<String>>,
    logs: Vec<(String, LogLevel, String)>,
    completions: Vec<(String, Completion)>,
}

/// Scripted [`Coordinator`](crate::Coordinator)
///
/// Poll results are consumed in order; once the script is exhausted every poll
/// returns [`PollOutcome::NoWork`]. Heartbeats, logs and completions are recorded
/// and can be made to fail.
#[derive(Clone, Default)]
pub struct MockCoordinator {
    state: Arc<Mutex<State>>,
    fail_heartbeats: bool,
    fail_logs: bool,
    fail_completions: bool,
}

impl MockCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a claimed task for the next poll
    pub fn with_task(self, claimed: ClaimedTask) -> Self {
        self.push_poll(Ok(PollOutcome::Claimed(claimed)));
        self
    }

    /// Queue a claim whose payload failed validation
    pub fn with_rejected_claim(self, run_id: impl Into<String>, reason: impl Into<String>) -> Self {
        self.push_poll(Ok(PollOutcome::Rejected {
            run_id: run_id.into(),
            reason: reason.into(),
        }));
        self
    }

    /// Queue an explicit no-work answer
    pub fn with_no_work(self) -> Self {
        self.push_poll(Ok(PollOutcome::NoWork));
        self
    }

    /// Queue a transport error for the next poll
    pub fn with_poll_error(self, message: impl Into<String>) -> Self {
        self.push_poll(Err(message.into()));
        self
    }

    pub fn failing_heartbeats(mut self) -> Self {
        self.fail_heartbeats = true;
        self
    }

    pub fn failing_logs(mut self) -> Self {
        self.fail_logs = true;
        self
    }

    pub fn failing_completions(mut self) -> Self {
        self.fail_completions = true;
        self
    }

    fn push_poll(&self, outcome: std::result::Result<PollOutcome, String>) {
        if let Ok(mut state) = self.state.lock() {
            state.polls.push_back(outcome);
        }
    }

    fn with_state<T: Default>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        self.state.lock().map(|mut s| f(&mut *s)).unwrap_or_default()
    }

    pub fn poll_count(&self) -> usize {
        self.with_state(|s| s.poll_count)
    }

    pub fn heartbeats(&self) -> Vec<Option<String>> {
        self.with_state(|s| s.heartbeats.clone())
    }

    pub fn logs(&self) -> Vec<(String, LogLevel, String)> {
        self.with_state(|s| s.logs.clone())
    }

    /// Log messages for one run, in the order they arrived
    pub fn log_messages(&self, run_id: &str) -> Vec<String> {
        self.with_state(|s| {
            s.logs
                .iter()
                .filter(|(id, _, _)| id == run_id)
                .map(|(_, _, message)| message.clone())
                .collect()
        })
    }

    pub fn completions(&self) -> Vec<(String, Completion)> {
        self.with_state(|s| s.completions.clone())
    }
}

#[async_trait]
impl crate::Coordinator for MockCoordinator {
    async fn poll(&self) -> Result<PollOutcome> {
        let next = self.with_state(|s| {
            s.poll_count += 1;
            s.polls.pop_front()
        });
        match next {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(message)) => Err(KilnError::Coordinator(message)),
            None => Ok(PollOutcome::NoWork),
        }
    }

    async fn heartbeat(&self, current_run: Option<&str>) -> Result<()> {
        self.with_state(|s| s.heartbeats.push(current_run.map(str::to_string)));
        if self.fail_heartbeats {
            return Err(KilnError::Coordinator("heartbeat rejected".to_string()));
        }
        Ok(())
    }

    async fn report_log(&self, run_id: &str, level: LogLevel, message: &str) -> Result<()> {
        if self.fail_logs {
            return Err(KilnError::Coordinator("log rejected".to_string()));
        }
        self.with_state(|s| {
            s.logs
                .push((run_id.to_string(), level, message.to_string()))
        });
        Ok(())
    }

    async fn report_completion(&self, run_id: &str, completion: &Completion) -> Result<()> {
        self.with_state(|s| s.completions.push((run_id.to_string(), completion.clone())));
        if self.fail_completions {
            return Err(KilnError::Coordinator("completion rejected".to_string()));
        }
        Ok(())
    }
}
