//! Per-item outcomes and the collected batch result

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ItemError;

/// Result of one work item: the work function's value, or why there is none
pub type Outcome<T, E> = Result<T, ItemError<E>>;

/// Lifecycle of a work item inside a batch
///
/// Items move `Pending → RateAdmitted → ConcurrencyAdmitted → Running →
/// Settled`, one step at a time. Cancellation can settle an item from any
/// earlier state. `Settled` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemState {
    Pending,
    RateAdmitted,
    ConcurrencyAdmitted,
    Running,
    Settled,
}

impl ItemState {
    /// The state that normally follows this one
    pub fn next(self) -> Option<ItemState> {
        match self {
            ItemState::Pending => Some(ItemState::RateAdmitted),
            ItemState::RateAdmitted => Some(ItemState::ConcurrencyAdmitted),
            ItemState::ConcurrencyAdmitted => Some(ItemState::Running),
            ItemState::Running => Some(ItemState::Settled),
            ItemState::Settled => None,
        }
    }

    /// Whether moving from `self` to `to` is a legal transition
    pub fn can_transition_to(self, to: ItemState) -> bool {
        self.next() == Some(to) || (to == ItemState::Settled && !self.is_terminal())
    }

    pub fn is_terminal(self) -> bool {
        self == ItemState::Settled
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ItemState::Pending => "pending",
            ItemState::RateAdmitted => "rate-admitted",
            ItemState::ConcurrencyAdmitted => "concurrency-admitted",
            ItemState::Running => "running",
            ItemState::Settled => "settled",
        };
        f.write_str(name)
    }
}

/// When an item ran, relative to the start of its batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timing {
    pub start: Duration,
    pub end: Duration,
}

impl Timing {
    pub fn latency(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }
}

/// A work item's recorded outcome
#[derive(Debug)]
pub struct Settled<T, E> {
    /// Position of the item in the submitted sequence
    pub index: usize,
    pub outcome: Outcome<T, E>,
    /// `None` when the item never started running
    pub timing: Option<Timing>,
}

impl<T, E> Settled<T, E> {
    pub fn cancelled(index: usize) -> Self {
        Self {
            index,
            outcome: Err(ItemError::Cancelled),
            timing: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn latency(&self) -> Option<Duration> {
        self.timing.map(|t| t.latency())
    }
}

/// Every item's outcome, indexed by submission order
#[derive(Debug)]
pub struct BatchResult<T, E> {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    /// The run was cancelled before every item could settle on its own
    pub cancelled: bool,
    /// Items handed to the work function
    pub launched: usize,
    /// Peak slots held on the concurrency gate during this run
    pub peak_in_flight: usize,
    pub items: Vec<Settled<T, E>>,
}

impl<T, E> BatchResult<T, E> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Settled<T, E>> {
        self.items.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Settled<T, E>> {
        self.items.iter()
    }

    pub fn outcomes(&self) -> impl Iterator<Item = &Outcome<T, E>> {
        self.items.iter().map(|s| &s.outcome)
    }

    pub fn into_outcomes(self) -> Vec<Outcome<T, E>> {
        self.items.into_iter().map(|s| s.outcome).collect()
    }

    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|s| s.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.len() - self.succeeded()
    }

    pub fn cancelled_items(&self) -> usize {
        self.items
            .iter()
            .filter(|s| matches!(&s.outcome, Err(e) if e.is_cancelled()))
            .count()
    }
}

impl<'a, T, E> IntoIterator for &'a BatchResult<T, E> {
    type Item = &'a Settled<T, E>;
    type IntoIter = std::slice::Iter<'a, Settled<T, E>>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_sequence() {
        let mut state = ItemState::Pending;
        let mut seen = vec![state];
        while let Some(next) = state.next() {
            assert!(state.can_transition_to(next));
            state = next;
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                ItemState::Pending,
                ItemState::RateAdmitted,
                ItemState::ConcurrencyAdmitted,
                ItemState::Running,
                ItemState::Settled,
            ]
        );
    }

    #[test]
    fn test_no_skipping_except_to_settled() {
        assert!(!ItemState::Pending.can_transition_to(ItemState::Running));
        assert!(!ItemState::RateAdmitted.can_transition_to(ItemState::Running));
        assert!(!ItemState::Running.can_transition_to(ItemState::Pending));
        assert!(ItemState::Pending.can_transition_to(ItemState::Settled));
        assert!(ItemState::RateAdmitted.can_transition_to(ItemState::Settled));
        assert!(!ItemState::Settled.can_transition_to(ItemState::Settled));
    }

    #[test]
    fn test_timing_latency() {
        let timing = Timing {
            start: Duration::from_millis(200),
            end: Duration::from_millis(350),
        };
        assert_eq!(timing.latency(), Duration::from_millis(150));
    }

    #[test]
    fn test_batch_counts() {
        let batch: BatchResult<u32, String> = BatchResult {
            run_id: Uuid::now_v7(),
            started_at: Utc::now(),
            elapsed: Duration::ZERO,
            cancelled: true,
            launched: 2,
            peak_in_flight: 1,
            items: vec![
                Settled {
                    index: 0,
                    outcome: Ok(1),
                    timing: None,
                },
                Settled {
                    index: 1,
                    outcome: Err(ItemError::Failed("nope".to_string())),
                    timing: None,
                },
                Settled::cancelled(2),
            ],
        };

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.succeeded(), 1);
        assert_eq!(batch.failed(), 2);
        assert_eq!(batch.cancelled_items(), 1);
        assert_eq!(batch.get(0).and_then(|s| s.outcome.as_ref().ok()), Some(&1));
    }
}
