//! Scheduler configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;
use crate::gate::RateAlgorithm;

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Max admissions per period
    #[serde(default = "default_rate")]
    pub rate: f64,

    /// Rate window duration in milliseconds
    #[serde(rename = "period-ms", default = "default_period_ms")]
    pub period_ms: u64,

    /// Max operations in flight
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Rate limiting algorithm
    #[serde(default)]
    pub algorithm: RateAlgorithm,
}

fn default_rate() -> f64 {
    10.0
}

fn default_period_ms() -> u64 {
    1000
}

fn default_concurrency() -> usize {
    5
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            rate: default_rate(),
            period_ms: default_period_ms(),
            concurrency: default_concurrency(),
            algorithm: RateAlgorithm::default(),
        }
    }
}

impl SchedulerConfig {
    /// `rate` admissions per second with at most `concurrency` in flight
    pub fn new(rate: f64, concurrency: usize) -> Self {
        Self {
            rate,
            concurrency,
            ..Default::default()
        }
    }

    /// Get the rate period as a Duration
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period_ms = period.as_millis() as u64;
        self
    }

    pub fn with_algorithm(mut self, algorithm: RateAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Check the limits before any gate is built
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.rate.is_finite() || self.rate <= 0.0 {
            return Err(ConfigError::InvalidRate(self.rate));
        }
        if self.period_ms == 0 {
            return Err(ConfigError::InvalidPeriod(self.period()));
        }
        if self.concurrency < 1 {
            return Err(ConfigError::InvalidConcurrency(self.concurrency));
        }
        Ok(())
    }
}
