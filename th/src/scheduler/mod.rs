//! Scheduler for batch dispatch
//!
//! Admits work items through a rate gate and a concurrency gate, runs them
//! concurrently, and collects one outcome per item in input order.

mod config;
mod core;
mod outcome;

pub use config::SchedulerConfig;
pub use core::Scheduler;
pub use outcome::{BatchResult, ItemState, Outcome, Settled, Timing};
