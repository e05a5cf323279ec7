//! Liveness reporter: periodic heartbeats for the lifetime of the process

use kiln_coordinator::Coordinator;
use kiln_core::fail_open::fail_open;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Spawn the heartbeat task.
///
/// The first heartbeat goes out immediately, then one per `interval`, each carrying
/// whatever run id `current_run` holds at that moment. Failures are logged and dropped.
/// The task ends when `cancel` fires.
pub fn spawn_liveness<C: Coordinator + 'static>(
    coordinator: Arc<C>,
    interval: Duration,
    current_run: watch::Receiver<Option<String>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let run_id = current_run.borrow().clone();
            debug!(run_id = ?run_id, "Sending heartbeat");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = fail_open("heartbeat", || coordinator.heartbeat(run_id.as_deref())) => {}
            }
        }
        debug!("Liveness reporter stopped");
    })
}
