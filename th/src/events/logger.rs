//! Event Logger - writes batch events to the tracing log
//!
//! The logger subscribes to the EventBus and records every event as a JSON
//! line at debug level, so a run's item lifecycle can be read back from the
//! log file.

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::bus::EventBus;
use super::types::BatchEvent;

/// Subscribe to `bus` and log events until every sender is gone
///
/// Resolves to the number of events logged. Subscribe happens before this
/// returns, so no event emitted afterwards is missed.
pub fn spawn_event_logger(bus: &EventBus) -> JoinHandle<usize> {
    debug!("spawn_event_logger: called");
    let rx = bus.subscribe();
    tokio::spawn(run_logger(rx))
}

async fn run_logger(mut rx: broadcast::Receiver<BatchEvent>) -> usize {
    let mut logged = 0;
    loop {
        match rx.recv().await {
            Ok(event) => {
                match serde_json::to_string(&event) {
                    Ok(json) => debug!(event_type = event.event_type(), event = %json, "Batch event"),
                    Err(e) => warn!(error = %e, "EventLogger: failed to serialize event"),
                }
                logged += 1;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "EventLogger: lagged, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!(logged, "EventLogger: channel closed");
                return logged;
            }
        }
    }
}
