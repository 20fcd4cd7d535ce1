//! Concurrency gate: bounds how many operations are in flight at once

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::{ConfigError, GateClosed};

/// Admits at most `limit` holders at a time
///
/// Backed by a fair semaphore, so waiters are served in FIFO order. Each grant
/// is a [`ConcurrencyPermit`]; the slot is released exactly once, when the
/// permit is released or dropped.
pub struct ConcurrencyGate {
    limit: usize,
    semaphore: Arc<Semaphore>,
    counters: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyGate {
    /// Create a gate with `limit` slots
    pub fn new(limit: usize) -> Result<Self, ConfigError> {
        debug!(limit, "ConcurrencyGate::new: called");
        if limit < 1 {
            return Err(ConfigError::InvalidConcurrency(limit));
        }
        Ok(Self {
            limit,
            semaphore: Arc::new(Semaphore::new(limit)),
            counters: Arc::new(Counters::default()),
        })
    }

    /// Wait for a free slot and take it
    pub async fn acquire(&self) -> Result<ConcurrencyPermit, GateClosed> {
        let permit = self.semaphore.clone().acquire_owned().await.map_err(|_| GateClosed)?;
        Ok(self.grant(permit))
    }

    /// Take a slot only if one is free right now
    pub fn try_acquire(&self) -> Option<ConcurrencyPermit> {
        self.semaphore.clone().try_acquire_owned().ok().map(|permit| self.grant(permit))
    }

    fn grant(&self, permit: OwnedSemaphorePermit) -> ConcurrencyPermit {
        let in_flight = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(in_flight, Ordering::SeqCst);
        debug!(in_flight, limit = self.limit, "ConcurrencyGate::grant: slot taken");
        ConcurrencyPermit {
            _permit: permit,
            counters: self.counters.clone(),
        }
    }

    /// Stop admitting; pending and future `acquire` calls fail with [`GateClosed`]
    pub fn close(&self) {
        debug!("ConcurrencyGate::close: called");
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Slots currently held
    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::SeqCst)
    }

    /// Slots currently free
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Highest number of slots held at once since creation or the last [`ConcurrencyGate::reset_peak`]
    pub fn peak(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }

    /// Restart peak tracking from the slots held right now
    pub fn reset_peak(&self) {
        self.counters.peak.store(self.in_flight(), Ordering::SeqCst);
    }
}

impl fmt::Debug for ConcurrencyGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrencyGate")
            .field("limit", &self.limit)
            .field("in_flight", &self.in_flight())
            .field("peak", &self.peak())
            .finish()
    }
}

/// A held concurrency slot
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct ConcurrencyPermit {
    // Drop runs before the fields are dropped, so the counter is decremented
    // before the semaphore permit goes back and a waiter is granted.
    _permit: OwnedSemaphorePermit,
    counters: Arc<Counters>,
}

impl ConcurrencyPermit {
    /// Give the slot back, waking one waiter
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for ConcurrencyPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrencyPermit").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_rejects_zero_limit() {
        assert_eq!(
            ConcurrencyGate::new(0).unwrap_err(),
            ConfigError::InvalidConcurrency(0)
        );
    }

    #[test]
    fn test_reset_peak_starts_from_current_holders() {
        let gate = ConcurrencyGate::new(3).unwrap();
        let a = gate.try_acquire().unwrap();
        let b = gate.try_acquire().unwrap();
        let c = gate.try_acquire().unwrap();
        drop((b, c));
        assert_eq!(gate.peak(), 3);

        gate.reset_peak();
        assert_eq!(gate.peak(), 1);
        a.release();
        gate.reset_peak();
        assert_eq!(gate.peak(), 0);
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let gate = ConcurrencyGate::new(2).unwrap();

        let a = gate.acquire().await.unwrap();
        let b = gate.acquire().await.unwrap();
        assert_eq!(gate.in_flight(), 2);
        assert_eq!(gate.available(), 0);
        assert!(gate.try_acquire().is_none());

        a.release();
        assert_eq!(gate.in_flight(), 1);
        assert_eq!(gate.available(), 1);

        drop(b);
        assert_eq!(gate.in_flight(), 0);
        assert_eq!(gate.peak(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_wakes_waiter() {
        let gate = Arc::new(ConcurrencyGate::new(1).unwrap());
        let held = gate.acquire().await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        held.release();
        waiter.await.unwrap().unwrap();
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_waiters_served_in_order() {
        let gate = Arc::new(ConcurrencyGate::new(1).unwrap());
        let held = gate.acquire().await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let mut handles = Vec::new();
        for id in 0..4 {
            let gate = gate.clone();
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                let permit = gate.acquire().await.unwrap();
                tx.send(id).unwrap();
                drop(permit);
            }));
            // Let each waiter enqueue before spawning the next
            tokio::task::yield_now().await;
        }
        drop(tx);

        held.release();
        for handle in handles {
            handle.await.unwrap();
        }

        let mut order = Vec::new();
        while let Some(id) = rx.recv().await {
            order.push(id);
        }
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_close_fails_waiters() {
        let gate = Arc::new(ConcurrencyGate::new(1).unwrap());
        let _held = gate.acquire().await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;

        gate.close();
        assert!(gate.is_closed());
        assert_eq!(waiter.await.unwrap(), Err(GateClosed));
        assert_eq!(gate.acquire().await.unwrap_err(), GateClosed);
    }
}
