//! # kiln-coordinator
//!
//! Client side of the coordinator protocol: claim tasks, send heartbeats, stream run
//! logs and report completions.
//!
//! ## Endpoints
//!
//! | Call | Path |
//! |---|---|
//! | poll | `POST /nodes/poll` (`204` = no work) |
//! | heartbeat | `POST /nodes/heartbeat` |
//! | run log | `POST /runs/{runId}/logs` |
//! | completion | `POST /runs/{runId}/complete` |

mod client;
mod mock;
pub mod wire;

pub use client::{Coordinator, CoordinatorClient};
pub use mock::MockCoordinator;
