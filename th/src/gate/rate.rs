//! Rate gate: bounds how many admissions happen per rolling period

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::ConfigError;

/// Admission algorithm used by a [`RateGate`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum RateAlgorithm {
    /// Bucket of one token refilled every `period / rate`. Admissions stay on a
    /// fixed grid, so at most one extra start can land in any window.
    #[default]
    TokenBucket,

    /// Counter reset at each window boundary. Up to twice the rate can be
    /// admitted across a boundary.
    FixedWindow,

    /// Log of admission instants inside the trailing window. Exact.
    SlidingLog,
}

impl fmt::Display for RateAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RateAlgorithm::TokenBucket => "token-bucket",
            RateAlgorithm::FixedWindow => "fixed-window",
            RateAlgorithm::SlidingLog => "sliding-log",
        };
        f.write_str(name)
    }
}

/// `period / rate`, rounded up to the next nanosecond so that `rate`
/// intervals never add up to less than one period
fn spacing(period: Duration, rate: f64) -> Duration {
    Duration::from_nanos((period.as_nanos() as f64 / rate).ceil() as u64)
}

/// Per-algorithm admission state
#[derive(Debug)]
enum Limiter {
    TokenBucket {
        interval: Duration,
        next_free: Option<Instant>,
    },
    FixedWindow {
        limit: usize,
        window: Duration,
        window_start: Option<Instant>,
        count: usize,
    },
    SlidingLog {
        limit: usize,
        window: Duration,
        admissions: VecDeque<Instant>,
    },
}

impl Limiter {
    fn new(algorithm: RateAlgorithm, rate: f64, period: Duration) -> Self {
        // Window algorithms count whole admissions. Below one per period the
        // window is stretched so that a single admission still fits.
        let (limit, window) = if rate >= 1.0 {
            (rate.floor() as usize, period)
        } else {
            (1, spacing(period, rate))
        };

        match algorithm {
            RateAlgorithm::TokenBucket => Limiter::TokenBucket {
                interval: spacing(period, rate),
                next_free: None,
            },
            RateAlgorithm::FixedWindow => Limiter::FixedWindow {
                limit,
                window,
                window_start: None,
                count: 0,
            },
            RateAlgorithm::SlidingLog => Limiter::SlidingLog {
                limit,
                window,
                admissions: VecDeque::new(),
            },
        }
    }

    /// Admit at `now`, or report how long until an admission could succeed
    fn admit(&mut self, now: Instant) -> Result<(), Duration> {
        match self {
            Limiter::TokenBucket { interval, next_free } => match *next_free {
                Some(free_at) if now < free_at => Err(free_at - now),
                Some(free_at) => {
                    // A waiter woken late stays on the free_at grid, so timer
                    // lateness does not add up; after a full idle interval the
                    // grid restarts at now and nothing is banked.
                    let base = if now < free_at + *interval { free_at } else { now };
                    *next_free = Some(base + *interval);
                    Ok(())
                }
                None => {
                    *next_free = Some(now + *interval);
                    Ok(())
                }
            },
            Limiter::FixedWindow {
                limit,
                window,
                window_start,
                count,
            } => {
                let start = match *window_start {
                    Some(start) if now.duration_since(start) < *window => start,
                    _ => {
                        *window_start = Some(now);
                        *count = 0;
                        now
                    }
                };
                if *count < *limit {
                    *count += 1;
                    Ok(())
                } else {
                    Err(start + *window - now)
                }
            }
            Limiter::SlidingLog {
                limit,
                window,
                admissions,
            } => {
                while admissions
                    .front()
                    .is_some_and(|oldest| now.duration_since(*oldest) >= *window)
                {
                    admissions.pop_front();
                }
                match admissions.front() {
                    Some(oldest) if admissions.len() >= *limit => Err(*oldest + *window - now),
                    _ => {
                        admissions.push_back(now);
                        Ok(())
                    }
                }
            }
        }
    }
}

/// Admits at most `rate` callers per `period`, independent of concurrency
///
/// The gate only touches its own counters. Waiting in [`RateGate::acquire`]
/// is cancellation-safe: a dropped waiter never consumes an admission.
pub struct RateGate {
    rate: f64,
    period: Duration,
    algorithm: RateAlgorithm,
    limiter: Mutex<Limiter>,
    admitted: AtomicU64,
}

impl RateGate {
    /// Create a gate admitting `rate` callers per `period`
    pub fn new(rate: f64, period: Duration, algorithm: RateAlgorithm) -> Result<Self, ConfigError> {
        debug!(rate, ?period, %algorithm, "RateGate::new: called");
        if !rate.is_finite() || rate <= 0.0 {
            return Err(ConfigError::InvalidRate(rate));
        }
        if period.is_zero() {
            return Err(ConfigError::InvalidPeriod(period));
        }

        Ok(Self {
            rate,
            period,
            algorithm,
            limiter: Mutex::new(Limiter::new(algorithm, rate, period)),
            admitted: AtomicU64::new(0),
        })
    }

    /// Token-bucket gate with a one second period
    pub fn per_second(rate: f64) -> Result<Self, ConfigError> {
        Self::new(rate, Duration::from_secs(1), RateAlgorithm::default())
    }

    /// Wait until admitting the caller keeps the gate within its rate, then admit
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire().await {
                Ok(()) => return,
                Err(retry_after) => {
                    debug!(?retry_after, "RateGate::acquire: rate limited, sleeping");
                    tokio::time::sleep(retry_after).await;
                }
            }
        }
    }

    /// Admit immediately if possible, otherwise return how long to wait
    pub async fn try_acquire(&self) -> Result<(), Duration> {
        let mut limiter = self.limiter.lock().await;
        limiter.admit(Instant::now())?;
        self.admitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Total admissions granted since creation
    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn algorithm(&self) -> RateAlgorithm {
        self.algorithm
    }
}

impl fmt::Debug for RateGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateGate")
            .field("rate", &self.rate)
            .field("period", &self.period)
            .field("algorithm", &self.algorithm)
            .field("admitted", &self.admitted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Feed arrivals (ms offsets) through a limiter, waiting whenever it refuses.
    /// Returns admission offsets from the first arrival.
    fn simulate(algorithm: RateAlgorithm, rate: f64, period_ms: u64, arrivals: &[u64]) -> Vec<Duration> {
        let base = Instant::now();
        let mut limiter = Limiter::new(algorithm, rate, Duration::from_millis(period_ms));
        let mut clock = Duration::ZERO;
        let mut admitted = Vec::new();

        for &arrival in arrivals {
            clock = clock.max(Duration::from_millis(arrival));
            loop {
                match limiter.admit(base + clock) {
                    Ok(()) => {
                        admitted.push(clock);
                        break;
                    }
                    Err(wait) => clock += wait,
                }
            }
        }
        admitted
    }

    fn millis(admitted: &[Duration]) -> Vec<u64> {
        admitted.iter().map(|d| d.as_millis() as u64).collect()
    }

    fn max_in_any_window(admissions: &[Duration], window: Duration) -> usize {
        admissions
            .iter()
            .map(|&start| {
                admissions
                    .iter()
                    .filter(|&&t| t >= start && t < start + window)
                    .count()
            })
            .max()
            .unwrap_or(0)
    }

    #[test]
    fn test_rejects_invalid_rate() {
        assert_eq!(
            RateGate::per_second(0.0).unwrap_err(),
            ConfigError::InvalidRate(0.0)
        );
        assert!(matches!(RateGate::per_second(-2.0), Err(ConfigError::InvalidRate(_))));
        assert!(matches!(RateGate::per_second(f64::NAN), Err(ConfigError::InvalidRate(_))));
        assert!(matches!(
            RateGate::per_second(f64::INFINITY),
            Err(ConfigError::InvalidRate(_))
        ));
    }

    #[test]
    fn test_rejects_zero_period() {
        let result = RateGate::new(5.0, Duration::ZERO, RateAlgorithm::TokenBucket);
        assert_eq!(result.unwrap_err(), ConfigError::InvalidPeriod(Duration::ZERO));
    }

    #[test]
    fn test_token_bucket_spacing() {
        let admitted = simulate(RateAlgorithm::TokenBucket, 5.0, 1000, &[0, 0, 0, 0, 0, 0]);
        assert_eq!(millis(&admitted), vec![0, 200, 400, 600, 800, 1000]);
    }

    #[test]
    fn test_token_bucket_does_not_accumulate() {
        // A long idle gap must not bank extra tokens
        let admitted = simulate(RateAlgorithm::TokenBucket, 2.0, 1000, &[0, 5000, 5000, 5000]);
        assert_eq!(millis(&admitted), vec![0, 5000, 5500, 6000]);
    }

    #[test]
    fn test_token_bucket_late_wakeup_does_not_drift() {
        let base = Instant::now();
        let mut limiter = Limiter::new(RateAlgorithm::TokenBucket, 5.0, Duration::from_secs(1));

        // Every caller after the first wakes 3ms after its slot opened
        for offset in [0, 203, 403, 603, 803] {
            assert_eq!(limiter.admit(base + Duration::from_millis(offset)), Ok(()));
        }
        // The sixth slot still opens at 1000ms, not 1015ms
        assert_eq!(
            limiter.admit(base + Duration::from_millis(990)),
            Err(Duration::from_millis(10))
        );
    }

    #[test]
    fn test_sliding_log_huge_rate() {
        let mut limiter = Limiter::new(RateAlgorithm::SlidingLog, 1e18, Duration::from_secs(1));
        let now = Instant::now();
        for _ in 0..3 {
            assert_eq!(limiter.admit(now), Ok(()));
        }
    }

    #[tokio::test]
    async fn test_huge_rate_gates_construct_and_admit() {
        for algorithm in [
            RateAlgorithm::TokenBucket,
            RateAlgorithm::FixedWindow,
            RateAlgorithm::SlidingLog,
        ] {
            let gate = RateGate::new(1e18, Duration::from_secs(1), algorithm).unwrap();
            for _ in 0..3 {
                assert!(gate.try_acquire().await.is_ok(), "{}", algorithm);
            }
            assert_eq!(gate.admitted(), 3);
        }
    }

    #[test]
    fn test_fixed_window_resets() {
        let admitted = simulate(RateAlgorithm::FixedWindow, 3.0, 1000, &[0, 0, 0, 0, 0]);
        assert_eq!(millis(&admitted), vec![0, 0, 0, 1000, 1000]);
    }

    #[test]
    fn test_fixed_window_boundary_burst() {
        // Window opened at 0; three late arrivals plus three just after the reset
        let admitted = simulate(RateAlgorithm::FixedWindow, 3.0, 1000, &[0, 990, 990, 1000, 1000, 1000]);
        assert_eq!(millis(&admitted), vec![0, 990, 990, 1000, 1000, 1000]);
        assert_eq!(max_in_any_window(&admitted, Duration::from_secs(1)), 5);
    }

    #[test]
    fn test_sliding_log_waits_for_oldest() {
        let admitted = simulate(RateAlgorithm::SlidingLog, 2.0, 1000, &[0, 300, 400, 400]);
        assert_eq!(millis(&admitted), vec![0, 300, 1000, 1300]);
    }

    #[test]
    fn test_fractional_rate_below_one() {
        let admitted = simulate(RateAlgorithm::SlidingLog, 0.5, 1000, &[0, 0, 0]);
        assert_eq!(millis(&admitted), vec![0, 2000, 4000]);

        let admitted = simulate(RateAlgorithm::TokenBucket, 0.5, 1000, &[0, 0]);
        assert_eq!(millis(&admitted), vec![0, 2000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_token() {
        let gate = RateGate::per_second(4.0).unwrap();
        let start = Instant::now();

        for _ in 0..5 {
            gate.acquire().await;
        }

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(1), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1010), "elapsed {:?}", elapsed);
        assert_eq!(gate.admitted(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire_reports_retry_after() {
        let gate = RateGate::new(1.0, Duration::from_millis(500), RateAlgorithm::SlidingLog).unwrap();

        assert!(gate.try_acquire().await.is_ok());
        let retry_after = gate.try_acquire().await.unwrap_err();
        assert_eq!(retry_after, Duration::from_millis(500));
        assert_eq!(gate.admitted(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_acquire_consumes_nothing() {
        let gate = RateGate::per_second(1.0).unwrap();
        gate.acquire().await;

        let timed_out = tokio::time::timeout(Duration::from_millis(100), gate.acquire()).await;
        assert!(timed_out.is_err());
        assert_eq!(gate.admitted(), 1);
    }

    proptest! {
        #[test]
        fn prop_sliding_log_never_exceeds_rate(
            rate in 1u32..20,
            mut arrivals in proptest::collection::vec(0u64..5000, 1..60),
        ) {
            arrivals.sort_unstable();
            let admitted = simulate(RateAlgorithm::SlidingLog, rate as f64, 1000, &arrivals);
            prop_assert_eq!(admitted.len(), arrivals.len());
            prop_assert!(max_in_any_window(&admitted, Duration::from_secs(1)) <= rate as usize);
        }

        #[test]
        fn prop_token_bucket_at_most_one_extra(
            rate in 1u32..20,
            mut arrivals in proptest::collection::vec(0u64..5000, 1..60),
        ) {
            arrivals.sort_unstable();
            let admitted = simulate(RateAlgorithm::TokenBucket, rate as f64, 1000, &arrivals);
            prop_assert_eq!(admitted.len(), arrivals.len());
            prop_assert!(max_in_any_window(&admitted, Duration::from_secs(1)) <= rate as usize + 1);
        }

        #[test]
        fn prop_fixed_window_at_most_double(
            rate in 1u32..20,
            mut arrivals in proptest::collection::vec(0u64..5000, 1..60),
        ) {
            arrivals.sort_unstable();
            let admitted = simulate(RateAlgorithm::FixedWindow, rate as f64, 1000, &arrivals);
            prop_assert_eq!(admitted.len(), arrivals.len());
            prop_assert!(max_in_any_window(&admitted, Duration::from_secs(1)) <= 2 * rate as usize);
        }
    }
}
