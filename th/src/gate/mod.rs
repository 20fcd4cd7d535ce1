//! Admission gates
//!
//! A [`RateGate`] bounds how many starts happen per period and a
//! [`ConcurrencyGate`] bounds how many operations run at once. The two are
//! independent; the scheduler acquires both before each launch.

mod concurrency;
mod rate;

pub use concurrency::{ConcurrencyGate, ConcurrencyPermit};
pub use rate::{RateAlgorithm, RateGate};
