//! # kiln-orchestrator
//!
//! Task execution for Kiln workers.
//!
//! ## Flow
//!
//! ```text
//! Worker ──poll──▶ TaskLifecycle ──claimed──▶ TaskPipeline
//!                                               ├─ WorkspaceManager::prepare
//!                                               ├─ RepairLoop (synthesize ⇄ validate)
//!                                               └─ Publisher (commit, push, PR)
//! ```
//!
//! The [`Worker`] runs one task at a time and always reports exactly one completion
//! per claimed run. Heartbeats come from a separate task spawned by
//! [`spawn_liveness`].

mod context;
mod lifecycle;
mod liveness;
mod pipeline;
mod prompt;
mod publish;
mod repair_loop;
mod state_machine;
mod synthesis;
mod validation;
mod worker;

pub use context::{build_context, truncate_chars};
pub use lifecycle::{RunLogger, TaskLifecycle};
pub use liveness::spawn_liveness;
pub use pipeline::{TaskExecutor, TaskPipeline};
pub use prompt::{build_user_prompt, system_prompt};
pub use publish::{commit_message, pull_request_body, Publisher};
pub use repair_loop::{LoopReport, RepairLoop, DEFAULT_MAX_ATTEMPTS};
pub use state_machine::{transition, LoopEvent, LoopState};
pub use synthesis::{ChangeSynthesizer, SynthesisEngine};
pub use validation::{
    detect_commands, run_command, ChangeValidator, CommandValidator, ValidationCommands,
    DEFAULT_VALIDATION_TIMEOUT,
};
pub use worker::{Worker, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_POLL_INTERVAL};
