//! Repair loop driver
//!
//! Runs synthesis and validation steps and feeds their outcomes through
//! [`transition`]. Attempt-scoped errors (provider trouble, empty responses, rejected
//! paths, failed commands) become diagnostics for the next attempt; anything else
//! aborts the task.

use kiln_core::{AttemptOutcome, ChangeSet, Result, Task};
use std::path::Path;
use tracing::debug;

use crate::lifecycle::RunLogger;
use crate::state_machine::{transition, LoopEvent, LoopState};
use crate::synthesis::ChangeSynthesizer;
use crate::validation::ChangeValidator;

pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

/// What a finished loop did
#[derive(Debug, Clone)]
pub struct LoopReport {
    /// `Succeeded` or `Exhausted`
    pub state: LoopState,
    pub synthesis_calls: usize,
    pub validation_calls: usize,
    pub history: Vec<AttemptOutcome>,
}

impl LoopReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.state, LoopState::Succeeded { .. })
    }

    pub fn attempts(&self) -> usize {
        self.state.attempt()
    }

    /// Final change set when the loop succeeded
    pub fn change_set(&self) -> Option<&ChangeSet> {
        match &self.state {
            LoopState::Succeeded { change_set, .. } => Some(change_set),
            _ => None,
        }
    }

    /// Last diagnostic when the loop was exhausted
    pub fn diagnostic(&self) -> Option<&str> {
        match &self.state {
            LoopState::Exhausted { diagnostic, .. } => Some(diagnostic),
            _ => None,
        }
    }
}

/// Bounded generate, validate, repair driver
pub struct RepairLoop<'a, S: ChangeSynthesizer + ?Sized, V: ChangeValidator + ?Sized> {
    synthesizer: &'a S,
    validator: &'a V,
    max_attempts: usize,
}

impl<'a, S: ChangeSynthesizer + ?Sized, V: ChangeValidator + ?Sized> RepairLoop<'a, S, V> {
    pub fn new(synthesizer: &'a S, validator: &'a V, max_attempts: usize) -> Self {
        Self {
            synthesizer,
            validator,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Drive the loop to a terminal state
    pub async fn run(&self, task: &Task, workspace: &Path, log: &RunLogger<'_>) -> Result<LoopReport> {
        let mut state = LoopState::initial();
        let mut report = LoopReport {
            state: LoopState::initial(),
            synthesis_calls: 0,
            validation_calls: 0,
            history: Vec::new(),
        };

        loop {
            let event = match &state {
                LoopState::Synthesizing {
                    attempt,
                    prior_failure,
                } => {
                    self.synthesize_step(task, workspace, *attempt, prior_failure.as_deref(), log, &mut report)
                        .await?
                }
                LoopState::Validating {
                    attempt,
                    change_set,
                } => {
                    self.validate_step(workspace, *attempt, change_set, log, &mut report)
                        .await?
                }
                LoopState::Succeeded { .. } | LoopState::Exhausted { .. } => break,
            };
            state = transition(state, event, self.max_attempts);
            debug!(state = state.name(), attempt = state.attempt(), "Repair loop advanced");
        }

        match &state {
            LoopState::Succeeded { attempts, .. } => {
                log.info(format!("Validation passed after {} attempt(s)", attempts))
                    .await
            }
            LoopState::Exhausted { attempts, .. } => {
                log.error(format!(
                    "Giving up after {} attempt(s); last failure recorded",
                    attempts
                ))
                .await
            }
            _ => {}
        }

        report.state = state;
        Ok(report)
    }

    async fn synthesize_step(
        &self,
        task: &Task,
        workspace: &Path,
        attempt: usize,
        prior_failure: Option<&str>,
        log: &RunLogger<'_>,
        report: &mut LoopReport,
    ) -> Result<LoopEvent> {
        log.info(format!(
            "Attempt {}/{}: generating changes",
            attempt, self.max_attempts
        ))
        .await;

        report.synthesis_calls += 1;
        match self.synthesizer.synthesize(task, workspace, prior_failure).await {
            Ok(change_set) => {
                log.info(format!(
                    "Attempt {}: proposed {} file(s): {}",
                    attempt,
                    change_set.len(),
                    change_set.paths().join(", ")
                ))
                .await;
                Ok(LoopEvent::Synthesized(change_set))
            }
            Err(e) if e.is_attempt_scoped() => {
                let diagnostic = format!("Change synthesis failed: {}", e);
                log.warn(format!("Attempt {}: {}", attempt, diagnostic)).await;
                report.history.push(AttemptOutcome {
                    attempt,
                    success: false,
                    change_set: ChangeSet::new(),
                    diagnostic: Some(diagnostic.clone()),
                });
                Ok(LoopEvent::SynthesisFailed(diagnostic))
            }
            Err(e) => Err(e),
        }
    }

    async fn validate_step(
        &self,
        workspace: &Path,
        attempt: usize,
        change_set: &ChangeSet,
        log: &RunLogger<'_>,
        report: &mut LoopReport,
    ) -> Result<LoopEvent> {
        let outcome = match self.validator.apply(workspace, change_set).await {
            Ok(()) => {
                report.validation_calls += 1;
                match self.validator.validate(workspace).await {
                    Ok(validation) if validation.passed => Ok(()),
                    Ok(validation) => Err(validation
                        .diagnostic
                        .unwrap_or_else(|| "validation failed without output".to_string())),
                    Err(e) if e.is_attempt_scoped() => Err(e.to_string()),
                    Err(e) => return Err(e),
                }
            }
            Err(e) if e.is_attempt_scoped() => Err(format!("Applying changes failed: {}", e)),
            Err(e) => return Err(e),
        };

        report.history.push(AttemptOutcome {
            attempt,
            success: outcome.is_ok(),
            change_set: change_set.clone(),
            diagnostic: outcome.as_ref().err().cloned(),
        });

        match outcome {
            Ok(()) => {
                log.info(format!("Attempt {}: validation passed", attempt)).await;
                Ok(LoopEvent::ValidationPassed)
            }
            Err(diagnostic) => {
                log.warn(format!("Attempt {}: validation failed\n{}", attempt, diagnostic))
                    .await;
                Ok(LoopEvent::ValidationFailed(diagnostic))
            }
        }
    }
}
