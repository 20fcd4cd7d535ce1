//! Event Bus - pub/sub for scheduler activity
//!
//! The EventBus uses a tokio broadcast channel to deliver events to all
//! subscribers. The scheduler emits, consumers subscribe.

use tokio::sync::broadcast;
use tracing::debug;

use super::types::BatchEvent;
use crate::scheduler::ItemState;

/// Default channel capacity (events)
///
/// Each item produces four transitions, so this buffers a few thousand items
/// for a slow subscriber before it starts lagging.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 16_384;

/// Central event bus for batch activity
pub struct EventBus {
    tx: broadcast::Sender<BatchEvent>,
}

impl EventBus {
    /// Create a new event bus with the given capacity
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "EventBus::new: creating event bus");
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Create a new event bus with default capacity
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Emit an event to all subscribers
    ///
    /// Fire-and-forget: with no subscribers the event is dropped.
    pub fn emit(&self, event: BatchEvent) {
        debug!(event_type = event.event_type(), run_id = event.run_id(), "EventBus::emit");
        let _ = self.tx.send(event);
    }

    /// Subscribe to events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        debug!("EventBus::subscribe: new subscriber");
        self.tx.subscribe()
    }

    /// Create an emitter bound to one batch run
    pub fn emitter_for(&self, run_id: impl Into<String>) -> EventEmitter {
        let run_id = run_id.into();
        debug!(%run_id, "EventBus::emitter_for: creating emitter");
        EventEmitter {
            tx: self.tx.clone(),
            run_id,
        }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Handle for emitting events of a single batch run
///
/// Cheap to clone; each spawned item task carries one.
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<BatchEvent>,
    run_id: String,
}

impl EventEmitter {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Emit a raw event
    pub fn emit(&self, event: BatchEvent) {
        let _ = self.tx.send(event);
    }

    // === Convenience methods ===

    pub fn batch_started(&self, total: usize) {
        self.emit(BatchEvent::BatchStarted {
            run_id: self.run_id.clone(),
            total,
        });
    }

    /// Emit a non-terminal transition
    pub fn transition(&self, index: usize, state: ItemState) {
        self.emit(BatchEvent::ItemTransition {
            run_id: self.run_id.clone(),
            index,
            state,
            success: None,
        });
    }

    pub fn settled(&self, index: usize, success: bool) {
        self.emit(BatchEvent::ItemTransition {
            run_id: self.run_id.clone(),
            index,
            state: ItemState::Settled,
            success: Some(success),
        });
    }

    pub fn batch_cancelled(&self, launched: usize) {
        self.emit(BatchEvent::BatchCancelled {
            run_id: self.run_id.clone(),
            launched,
        });
    }

    pub fn batch_finished(&self, succeeded: usize, failed: usize, elapsed_ms: u64) {
        self.emit(BatchEvent::BatchFinished {
            run_id: self.run_id.clone(),
            succeeded,
            failed,
            elapsed_ms,
        });
    }
}
