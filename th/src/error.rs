//! Error types for the throttler
//!
//! Only [`ConfigError`] can abort a run, and it is raised before any work
//! starts. Everything that goes wrong for a single item is an [`ItemError`]
//! stored in that item's outcome.

use std::time::Duration;

use thiserror::Error;

/// Invalid limits or finder settings, rejected at construction time
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("rate must be a positive, finite number of admissions per period (got {0})")]
    InvalidRate(f64),

    #[error("period must be greater than zero (got {0:?})")]
    InvalidPeriod(Duration),

    #[error("concurrency must be at least 1 (got {0})")]
    InvalidConcurrency(usize),

    #[error("invalid rate range: min-rate {min} must be positive and below max-rate {max}")]
    InvalidRange { min: f64, max: f64 },

    #[error("{name} must be within [0, 1] (got {value})")]
    InvalidThreshold { name: &'static str, value: f64 },
}

/// Failure recorded as a single item's outcome
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ItemError<E> {
    /// The caller's work function returned an error
    #[error("work item failed: {0}")]
    Failed(E),

    /// The batch was cancelled before this item settled
    #[error("work item cancelled")]
    Cancelled,

    /// The task running the work function panicked
    #[error("work item panicked: {0}")]
    Panicked(String),
}

impl<E> ItemError<E> {
    /// Short machine-friendly name of the failure kind
    pub fn kind(&self) -> &'static str {
        match self {
            ItemError::Failed(_) => "failed",
            ItemError::Cancelled => "cancelled",
            ItemError::Panicked(_) => "panicked",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ItemError::Cancelled)
    }
}

/// The concurrency gate was closed while waiting for a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("concurrency gate is closed")]
pub struct GateClosed;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_messages() {
        let err = ConfigError::InvalidRate(0.0);
        assert!(err.to_string().contains("got 0"));

        let err = ConfigError::InvalidConcurrency(0);
        assert_eq!(err.to_string(), "concurrency must be at least 1 (got 0)");
    }

    #[test]
    fn test_item_error_kind() {
        let failed: ItemError<String> = ItemError::Failed("boom".to_string());
        assert_eq!(failed.kind(), "failed");
        assert_eq!(failed.to_string(), "work item failed: boom");
        assert!(!failed.is_cancelled());

        let cancelled: ItemError<String> = ItemError::Cancelled;
        assert_eq!(cancelled.kind(), "cancelled");
        assert!(cancelled.is_cancelled());

        let panicked: ItemError<String> = ItemError::Panicked("oops".to_string());
        assert_eq!(panicked.kind(), "panicked");
    }
}
