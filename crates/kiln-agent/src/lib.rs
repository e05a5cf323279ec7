//! # kiln-agent
//!
//! Generative provider client and FILE block executor for Kiln.
//!
//! - [`CodeProvider`]: stateless `complete(system, user)` seam, implemented by
//!   [`AnthropicProvider`] (429/5xx back-off plus a process-wide [`CircuitBreaker`])
//! - [`parse_file_blocks`] / [`apply_change_set`]: turn provider output into whole-file
//!   edits and write them safely into a workspace

mod circuit_breaker;
mod client;
mod file_executor;
mod types;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use client::{AnthropicProvider, CodeProvider, MockProvider, ProviderCall};
pub use file_executor::{
    apply_change_set, file_block_instructions, parse_file_blocks, validate_path, ApplyResult,
    DEFAULT_PROTECTED,
};
pub use types::*;
