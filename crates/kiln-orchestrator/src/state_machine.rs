//! Pure state machine for the repair loop
//!
//! No I/O, no async. `transition` is deterministic and never panics: an event
//! that makes no sense for the current state ends the loop as `Exhausted`.

use kiln_core::ChangeSet;

/// Repair loop state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopState {
    /// Waiting for a change set for `attempt` (1-based)
    Synthesizing {
        attempt: usize,
        prior_failure: Option<String>,
    },
    /// Change set produced, waiting for verification
    Validating { attempt: usize, change_set: ChangeSet },
    /// Verification passed
    Succeeded { attempts: usize, change_set: ChangeSet },
    /// Attempts used up; carries the last diagnostic
    Exhausted { attempts: usize, diagnostic: String },
}

/// Outcome of the step the current state asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopEvent {
    Synthesized(ChangeSet),
    SynthesisFailed(String),
    ValidationPassed,
    ValidationFailed(String),
}

impl LoopState {
    pub fn initial() -> Self {
        LoopState::Synthesizing {
            attempt: 1,
            prior_failure: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopState::Succeeded { .. } | LoopState::Exhausted { .. })
    }

    /// Current attempt number, or attempts used for terminal states
    pub fn attempt(&self) -> usize {
        match self {
            LoopState::Synthesizing { attempt, .. } | LoopState::Validating { attempt, .. } => {
                *attempt
            }
            LoopState::Succeeded { attempts, .. } | LoopState::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LoopState::Synthesizing { .. } => "Synthesizing",
            LoopState::Validating { .. } => "Validating",
            LoopState::Succeeded { .. } => "Succeeded",
            LoopState::Exhausted { .. } => "Exhausted",
        }
    }
}

fn retry_or_exhaust(attempt: usize, max_attempts: usize, diagnostic: String) -> LoopState {
    if attempt < max_attempts {
        LoopState::Synthesizing {
            attempt: attempt + 1,
            prior_failure: Some(diagnostic),
        }
    } else {
        LoopState::Exhausted {
            attempts: attempt,
            diagnostic,
        }
    }
}

/// Advance the loop. `max_attempts` bounds how many synthesis attempts may run.
///
/// Terminal states absorb every event unchanged.
pub fn transition(state: LoopState, event: LoopEvent, max_attempts: usize) -> LoopState {
    match (state, event) {
        (LoopState::Synthesizing { attempt, .. }, LoopEvent::Synthesized(change_set)) => {
            LoopState::Validating {
                attempt,
                change_set,
            }
        }
        (LoopState::Synthesizing { attempt, .. }, LoopEvent::SynthesisFailed(diagnostic)) => {
            retry_or_exhaust(attempt, max_attempts, diagnostic)
        }
        (LoopState::Validating { attempt, change_set }, LoopEvent::ValidationPassed) => {
            LoopState::Succeeded {
                attempts: attempt,
                change_set,
            }
        }
        (LoopState::Validating { attempt, .. }, LoopEvent::ValidationFailed(diagnostic)) => {
            retry_or_exhaust(attempt, max_attempts, diagnostic)
        }
        (terminal, _) if terminal.is_terminal() => terminal,
        (state, event) => LoopState::Exhausted {
            attempts: state.attempt(),
            diagnostic: format!("invalid transition: {:?} in state {}", event, state.name()),
        },
    }
}
