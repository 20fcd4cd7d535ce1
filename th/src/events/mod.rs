//! Batch activity streaming
//!
//! The scheduler publishes batch and item lifecycle events on an
//! [`EventBus`]. Subscribers (progress displays, tests) receive them as they
//! happen; the batch result itself does not depend on anyone listening.

mod bus;
mod logger;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus, EventEmitter};
pub use logger::spawn_event_logger;
pub use types::BatchEvent;
