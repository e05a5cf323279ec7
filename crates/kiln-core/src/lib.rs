//! # kiln-core
//!
//! Core types for the Kiln autonomous task worker.
//!
//! Kiln claims tasks from a coordinator, asks a generative provider for whole-file
//! changes, validates them with the project's own test command and publishes the
//! result as a branch plus pull request.
//!
//! ## Core Paradigm
//!
//! - A task is claimed once per run and always ends with exactly one completion report
//! - Every edit is a whole-file overwrite (no patches)
//! - Validation is "the project's own command exits zero", nothing more
//! - Nothing unvalidated is ever pushed

pub mod config;
mod error;
pub mod fail_open;
mod types;

pub use config::{RepoConfig, WorkerConfig};
pub use error::{KilnError, Result};
pub use types::*;
