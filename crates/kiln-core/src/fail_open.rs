//! Fail-open utilities for best-effort infrastructure calls
//!
//! Heartbeats and run log lines must never change the outcome of a task. Wrap them
//! here so a failure is logged locally and then dropped.
//!
//! DO NOT use fail-open for:
//! - Workspace preparation (task correctness)
//! - Validation (the whole point of the worker)
//! - Completion reports (logged at error level by the caller instead)

use std::future::Future;
use tracing::warn;

use crate::Result;

/// Execute an operation that should fail open
///
/// Logs the error via `tracing::warn!` on failure and returns `None`.
///
/// # Usage
///
/// ```no_run
/// use kiln_core::fail_open::fail_open;
/// use kiln_core::Result;
///
/// async fn send_heartbeat() -> Result<()> {
///     Ok(())
/// }
///
/// async fn example() {
///     let sent = fail_open("heartbeat", || send_heartbeat()).await;
///     // sent is None if the heartbeat failed
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!(operation = operation_name, error = %e, "best-effort call failed (fail-open)");
            None
        }
    }
}
