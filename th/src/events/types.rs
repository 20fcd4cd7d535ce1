//! Event types for batch activity streaming

use serde::{Deserialize, Serialize};

use crate::scheduler::ItemState;

/// Observable scheduler activity
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BatchEvent {
    /// A batch run has started; every item is pending
    BatchStarted { run_id: String, total: usize },

    /// An item moved to a new lifecycle state
    ItemTransition {
        run_id: String,
        index: usize,
        state: ItemState,
        /// Set on `Settled`: whether the item succeeded
        #[serde(skip_serializing_if = "Option::is_none")]
        success: Option<bool>,
    },

    /// Cancellation was observed; no further items are admitted
    BatchCancelled { run_id: String, launched: usize },

    /// Every item has settled
    BatchFinished {
        run_id: String,
        succeeded: usize,
        failed: usize,
        elapsed_ms: u64,
    },
}

impl BatchEvent {
    /// Get the event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            BatchEvent::BatchStarted { .. } => "BatchStarted",
            BatchEvent::ItemTransition { .. } => "ItemTransition",
            BatchEvent::BatchCancelled { .. } => "BatchCancelled",
            BatchEvent::BatchFinished { .. } => "BatchFinished",
        }
    }

    /// Get the run ID this event belongs to
    pub fn run_id(&self) -> &str {
        match self {
            BatchEvent::BatchStarted { run_id, .. }
            | BatchEvent::ItemTransition { run_id, .. }
            | BatchEvent::BatchCancelled { run_id, .. }
            | BatchEvent::BatchFinished { run_id, .. } => run_id,
        }
    }
}
