//! Rate finder: binary search for the highest acceptable request rate
//!
//! Each iteration runs a trial batch at the midpoint of `[min_rate, max_rate]`.
//! A trial is acceptable when the mean latency stays below
//! `concurrency * period / rate` (the time budget each slot has per start),
//! the error rate stays below `error-threshold`, and the share of "bad"
//! statuses (429 and 500 by default) stays below `bad-status-threshold`.
//! Acceptable trials raise the lower bound, others lower the upper bound.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::stats::BatchStats;

/// Rate finder configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinderConfig {
    /// Lower bound of the search, admissions per period
    #[serde(rename = "min-rate")]
    pub min_rate: f64,

    /// Upper bound of the search, admissions per period
    #[serde(rename = "max-rate")]
    pub max_rate: f64,

    /// Highest acceptable share of failed requests
    #[serde(rename = "error-threshold")]
    pub error_threshold: f64,

    /// Highest acceptable share of bad statuses
    #[serde(rename = "bad-status-threshold")]
    pub bad_status_threshold: f64,

    /// Status codes that count as the endpoint pushing back
    #[serde(rename = "bad-statuses")]
    pub bad_statuses: Vec<u16>,

    /// Number of trial batches to run
    #[serde(rename = "max-iterations")]
    pub max_iterations: u32,
}

impl Default for FinderConfig {
    fn default() -> Self {
        Self {
            min_rate: 1.0,
            max_rate: 100.0,
            error_threshold: 0.1,
            bad_status_threshold: 0.1,
            bad_statuses: vec![429, 500],
            max_iterations: 10,
        }
    }
}

impl FinderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let range_ok = self.min_rate.is_finite()
            && self.max_rate.is_finite()
            && self.min_rate > 0.0
            && self.min_rate < self.max_rate;
        if !range_ok {
            return Err(ConfigError::InvalidRange {
                min: self.min_rate,
                max: self.max_rate,
            });
        }
        for (name, value) in [
            ("error-threshold", self.error_threshold),
            ("bad-status-threshold", self.bad_status_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidThreshold { name, value });
            }
        }
        Ok(())
    }
}

/// Why a trial rate was judged too fast
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
pub enum Rejection {
    /// Nothing succeeded, so there is no latency to judge
    NoSuccesses,
    Latency { mean: f64, threshold: f64 },
    ErrorRate { rate: f64, threshold: f64 },
    BadStatus { rate: f64, threshold: f64 },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::NoSuccesses => write!(f, "no request succeeded"),
            Rejection::Latency { mean, threshold } => {
                write!(f, "mean latency {:.4}s above {:.4}s", mean, threshold)
            }
            Rejection::ErrorRate { rate, threshold } => {
                write!(f, "error rate {:.1}% above {:.1}%", rate * 100.0, threshold * 100.0)
            }
            Rejection::BadStatus { rate, threshold } => {
                write!(f, "bad status rate {:.1}% above {:.1}%", rate * 100.0, threshold * 100.0)
            }
        }
    }
}

/// Result of one trial batch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trial {
    pub iteration: u32,
    pub rate: f64,
    /// Mean latency budget at this rate, in seconds
    pub latency_threshold: f64,
    pub stats: BatchStats,
    /// `None` when the rate was acceptable
    pub rejection: Option<Rejection>,
}

impl Trial {
    pub fn is_acceptable(&self) -> bool {
        self.rejection.is_none()
    }
}

/// Outcome of a full search
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RateSearch {
    /// Highest acceptable rate tried, if any was acceptable
    pub best_rate: Option<f64>,
    pub best_stats: Option<BatchStats>,
    pub trials: Vec<Trial>,
}

/// Binary-searches the rate between the configured bounds
#[derive(Debug, Clone)]
pub struct RateFinder {
    config: FinderConfig,
    base: SchedulerConfig,
}

impl RateFinder {
    /// Trials use `base` for everything except the rate
    pub fn new(config: FinderConfig, base: SchedulerConfig) -> Result<Self, ConfigError> {
        debug!(?config, ?base, "RateFinder::new: called");
        config.validate()?;
        // Any rate would do here; this checks concurrency and period up front
        SchedulerConfig {
            rate: config.min_rate,
            ..base.clone()
        }
        .validate()?;
        Ok(Self { config, base })
    }

    pub fn config(&self) -> &FinderConfig {
        &self.config
    }

    /// Mean latency budget at `rate`, in seconds
    pub fn latency_threshold(&self, rate: f64) -> f64 {
        self.base.concurrency as f64 * self.base.period().as_secs_f64() / rate
    }

    /// Judge a trial's statistics; `None` means acceptable
    pub fn evaluate(&self, rate: f64, stats: &BatchStats) -> Option<Rejection> {
        let Some(mean) = stats.mean_latency() else {
            return Some(Rejection::NoSuccesses);
        };

        let threshold = self.latency_threshold(rate);
        if mean > threshold {
            return Some(Rejection::Latency { mean, threshold });
        }

        if stats.error_rate > self.config.error_threshold {
            return Some(Rejection::ErrorRate {
                rate: stats.error_rate,
                threshold: self.config.error_threshold,
            });
        }

        let bad_rate = stats.status_rate(&self.config.bad_statuses);
        if bad_rate > self.config.bad_status_threshold {
            return Some(Rejection::BadStatus {
                rate: bad_rate,
                threshold: self.config.bad_status_threshold,
            });
        }

        None
    }

    /// Run the search, calling `trial` with the scheduler config for each candidate rate
    pub async fn search<F, Fut>(&self, mut trial: F) -> eyre::Result<RateSearch>
    where
        F: FnMut(SchedulerConfig) -> Fut,
        Fut: Future<Output = eyre::Result<Option<BatchStats>>>,
    {
        let mut min_rate = self.config.min_rate;
        let mut max_rate = self.config.max_rate;
        let mut search = RateSearch::default();

        for iteration in 1..=self.config.max_iterations {
            let rate = (min_rate + max_rate) / 2.0;
            let latency_threshold = self.latency_threshold(rate);
            info!(iteration, rate, latency_threshold, "Testing rate");

            let config = SchedulerConfig {
                rate,
                ..self.base.clone()
            };
            let Some(stats) = trial(config).await? else {
                info!(iteration, rate, "Trial interrupted, stopping search");
                break;
            };

            let rejection = self.evaluate(rate, &stats);
            match &rejection {
                None => {
                    info!(rate, mean = ?stats.mean_latency(), "Conditions acceptable, raising lower bound");
                    min_rate = rate;
                    search.best_rate = Some(rate);
                    search.best_stats = Some(stats.clone());
                }
                Some(reason) => {
                    info!(rate, %reason, "Rate too high, lowering upper bound");
                    max_rate = rate;
                }
            }

            search.trials.push(Trial {
                iteration,
                rate,
                latency_threshold,
                stats,
                rejection,
            });
        }

        Ok(search)
    }

    /// Search by running `targets` through `perform` once per trial
    ///
    /// `status_of` extracts the status code used for the bad-status check.
    /// Cancelling `cancel` stops the current trial and ends the search.
    pub async fn search_targets<W, T, E, P, Fut, S>(
        &self,
        targets: Vec<W>,
        perform: P,
        status_of: S,
        cancel: CancellationToken,
    ) -> eyre::Result<RateSearch>
    where
        W: Clone + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
        P: Fn(W) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        S: Fn(&T) -> u16,
    {
        let perform = Arc::new(perform);
        let status_of = &status_of;

        self.search(|config| {
            let targets = targets.clone();
            let perform = perform.clone();
            let cancel = cancel.clone();
            async move {
                if cancel.is_cancelled() {
                    return Ok(None);
                }
                let scheduler = Scheduler::new(config)?;
                let batch = scheduler
                    .run_until_cancelled(targets, move |target| (*perform)(target), cancel)
                    .await;
                if batch.cancelled {
                    return Ok(None);
                }
                Ok::<_, eyre::Report>(Some(
                    BatchStats::from_batch(&batch).with_status_counts(&batch, status_of),
                ))
            }
        })
        .await
    }
}
