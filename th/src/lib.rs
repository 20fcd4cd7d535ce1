//! Throttler - rate- and concurrency-bounded batch dispatcher
//!
//! Throttler runs a batch of independent async operations (typically HTTP
//! requests) while holding two limits at once: at most R starts per period,
//! and at most C operations in flight. Every item gets exactly one outcome,
//! reported in input order, whether it succeeded, failed, panicked or was
//! cancelled.
//!
//! # Core Concepts
//!
//! - **Two gates**: a [`gate::RateGate`] spaces starts, a [`gate::ConcurrencyGate`] bounds in-flight work
//! - **Failure isolation**: one item's error or panic never touches another item
//! - **Input order**: results are indexed like the input, not by completion
//! - **Injected work**: the operation is a closure, so anything async can be throttled
//!
//! # Modules
//!
//! - [`scheduler`] - Batch dispatch and outcome collection
//! - [`gate`] - Rate and concurrency gates
//! - [`events`] - Batch lifecycle events
//! - [`stats`] - Latency and error statistics
//! - [`finder`] - Binary search for a sustainable rate
//! - [`http`] - HTTP GET probe used by the CLI
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod finder;
pub mod gate;
pub mod http;
pub mod scheduler;
pub mod stats;

// Re-export commonly used types
pub use config::Config;
pub use error::{ConfigError, GateClosed, ItemError};
pub use events::{BatchEvent, EventBus, EventEmitter};
pub use finder::{FinderConfig, RateFinder, RateSearch, Rejection, Trial};
pub use gate::{ConcurrencyGate, ConcurrencyPermit, RateAlgorithm, RateGate};
pub use http::{HttpConfig, HttpProbe, ProbeError, ProbeResponse};
pub use scheduler::{BatchResult, ItemState, Outcome, Scheduler, SchedulerConfig, Settled, Timing};
pub use stats::{BatchStats, LatencySummary};
