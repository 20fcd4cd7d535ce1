//! Latency and error statistics over a finished batch

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ItemError;
use crate::scheduler::BatchResult;

/// Latency summary of the successful items, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub mean: f64,
    /// Population standard deviation
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
}

impl LatencySummary {
    /// Summarize a set of latencies; `None` when there are none
    pub fn from_latencies(latencies: &[Duration]) -> Option<Self> {
        if latencies.is_empty() {
            return None;
        }

        let secs: Vec<f64> = latencies.iter().map(Duration::as_secs_f64).collect();
        let n = secs.len() as f64;
        let mean = secs.iter().sum::<f64>() / n;
        let variance = secs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let min = secs.iter().copied().fold(f64::INFINITY, f64::min);
        let max = secs.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        Some(Self {
            mean,
            std_dev: variance.max(0.0).sqrt(),
            min,
            max,
        })
    }
}

/// Outcome counts, latency summary and status distribution of one batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchStats {
    /// Items that ran to a result (succeeded + failed)
    pub total: usize,
    pub succeeded: usize,
    /// Items whose work function failed or panicked
    pub failed: usize,
    /// Items cancelled before settling; not part of `total`
    pub cancelled: usize,
    /// `None` when nothing succeeded
    pub latency: Option<LatencySummary>,
    /// `failed / total`, 0 when nothing ran
    pub error_rate: f64,
    /// Count per status code, filled by [`BatchStats::with_status_counts`]
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub status_distribution: BTreeMap<u16, usize>,
}

impl BatchStats {
    /// Compute counts and latency from a batch result
    pub fn from_batch<T, E>(batch: &BatchResult<T, E>) -> Self {
        debug!(items = batch.len(), "BatchStats::from_batch: called");
        let mut stats = BatchStats::default();
        let mut latencies = Vec::new();

        for settled in batch {
            match &settled.outcome {
                Ok(_) => {
                    stats.succeeded += 1;
                    if let Some(latency) = settled.latency() {
                        latencies.push(latency);
                    }
                }
                Err(ItemError::Cancelled) => stats.cancelled += 1,
                Err(ItemError::Failed(_) | ItemError::Panicked(_)) => stats.failed += 1,
            }
        }

        stats.total = stats.succeeded + stats.failed;
        stats.error_rate = if stats.total > 0 {
            stats.failed as f64 / stats.total as f64
        } else {
            0.0
        };
        stats.latency = LatencySummary::from_latencies(&latencies);
        stats
    }

    /// Count successful items by the status code `status_of` extracts
    pub fn with_status_counts<T, E>(mut self, batch: &BatchResult<T, E>, status_of: impl Fn(&T) -> u16) -> Self {
        for value in batch.outcomes().filter_map(|o| o.as_ref().ok()) {
            *self.status_distribution.entry(status_of(value)).or_insert(0) += 1;
        }
        self
    }

    /// Fraction of `total` that answered with one of `statuses`
    pub fn status_rate(&self, statuses: &[u16]) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let hits: usize = statuses
            .iter()
            .filter_map(|code| self.status_distribution.get(code))
            .sum();
        hits as f64 / self.total as f64
    }

    pub fn mean_latency(&self) -> Option<f64> {
        self.latency.map(|l| l.mean)
    }
}
