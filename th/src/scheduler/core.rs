//! Scheduler implementation

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ConfigError, GateClosed, ItemError};
use crate::events::{EventBus, EventEmitter};
use crate::gate::{ConcurrencyGate, ConcurrencyPermit, RateGate};

use super::config::SchedulerConfig;
use super::outcome::{BatchResult, ItemState, Settled, Timing};

/// Dispatches a batch of work items under a rate limit and a concurrency limit
///
/// For each item, in submission order, the scheduler waits for a rate token,
/// then for a concurrency slot, then spawns the work function and moves on
/// without waiting for it. Outcomes are stored by input index, so the result
/// order never depends on completion order.
pub struct Scheduler {
    rate: RateGate,
    concurrency: ConcurrencyGate,
    events: Option<Arc<EventBus>>,
}

impl Scheduler {
    /// Create a scheduler with gates built from `config`
    pub fn new(config: SchedulerConfig) -> Result<Self, ConfigError> {
        debug!(?config, "Scheduler::new: called");
        config.validate()?;
        let rate = RateGate::new(config.rate, config.period(), config.algorithm)?;
        let concurrency = ConcurrencyGate::new(config.concurrency)?;
        Ok(Self::from_gates(rate, concurrency))
    }

    /// Create a scheduler around caller-built gates
    pub fn from_gates(rate: RateGate, concurrency: ConcurrencyGate) -> Self {
        debug!(?rate, ?concurrency, "Scheduler::from_gates: called");
        Self {
            rate,
            concurrency,
            events: None,
        }
    }

    /// Publish batch and item lifecycle events on `bus`
    pub fn with_events(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn rate_gate(&self) -> &RateGate {
        &self.rate
    }

    pub fn concurrency_gate(&self) -> &ConcurrencyGate {
        &self.concurrency
    }

    /// Run every item through `perform` and collect all outcomes
    pub async fn run<W, T, E, F, Fut>(&self, items: Vec<W>, perform: F) -> BatchResult<T, E>
    where
        W: Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
        F: Fn(W) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.run_until_cancelled(items, perform, CancellationToken::new()).await
    }

    /// Like [`Scheduler::run`], stopping early when `cancel` fires
    ///
    /// After cancellation no further items are admitted, running items have
    /// their work future dropped, and every item that had not settled is
    /// recorded as [`ItemError::Cancelled`]. All slots are back on the gate
    /// by the time this returns.
    pub async fn run_until_cancelled<W, T, E, F, Fut>(
        &self,
        items: Vec<W>,
        perform: F,
        cancel: CancellationToken,
    ) -> BatchResult<T, E>
    where
        W: Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
        F: Fn(W) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let run_id = Uuid::now_v7();
        let total = items.len();
        let started_at = Utc::now();
        let batch_start = Instant::now();
        let emitter = self.events.as_ref().map(|bus| bus.emitter_for(run_id.to_string()));
        let perform = Arc::new(perform);
        self.concurrency.reset_peak();

        info!(%run_id, total, rate = self.rate.rate(), concurrency = self.concurrency.limit(), "Batch starting");
        if let Some(emitter) = &emitter {
            emitter.batch_started(total);
        }

        let mut collector = Collector::new(total, emitter.clone());
        let mut tasks = JoinSet::new();
        let mut launched = 0;
        let mut stopped = false;

        for (index, item) in items.into_iter().enumerate() {
            while let Some(joined) = tasks.try_join_next_with_id() {
                collector.record(joined);
            }

            let admitted = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(%run_id, index, "Scheduler::run: cancelled while admitting");
                    stopped = true;
                    break;
                }
                admitted = self.admit(index, emitter.as_ref()) => admitted,
            };

            let permit = match admitted {
                Ok(permit) => permit,
                Err(GateClosed) => {
                    warn!(%run_id, index, "Concurrency gate closed, no further items admitted");
                    stopped = true;
                    break;
                }
            };

            let task = ItemTask {
                index,
                batch_start,
                permit,
                cancel: cancel.clone(),
                emitter: emitter.clone(),
            };
            let handle = tasks.spawn(task.run(perform.clone(), item));
            collector.track(handle.id(), index);
            launched += 1;
        }

        if stopped {
            info!(%run_id, launched, total, "Batch stopped early");
            if let Some(emitter) = &emitter {
                emitter.batch_cancelled(launched);
            }
        }

        debug!(%run_id, in_flight = tasks.len(), "Scheduler::run: waiting for running items");
        while let Some(joined) = tasks.join_next_with_id().await {
            collector.record(joined);
        }

        let items = collector.finish();
        let result = BatchResult {
            run_id,
            started_at,
            elapsed: batch_start.elapsed(),
            cancelled: stopped || cancel.is_cancelled(),
            launched,
            peak_in_flight: self.concurrency.peak(),
            items,
        };

        info!(
            %run_id,
            succeeded = result.succeeded(),
            failed = result.failed(),
            cancelled = result.cancelled,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "Batch finished"
        );
        if let Some(emitter) = &emitter {
            emitter.batch_finished(result.succeeded(), result.failed(), result.elapsed.as_millis() as u64);
        }
        result
    }

    /// Take a rate token, then a concurrency slot
    async fn admit(&self, index: usize, emitter: Option<&EventEmitter>) -> Result<ConcurrencyPermit, GateClosed> {
        self.rate.acquire().await;
        debug!(index, "Scheduler::admit: rate admitted");
        if let Some(emitter) = emitter {
            emitter.transition(index, ItemState::RateAdmitted);
        }

        let permit = self.concurrency.acquire().await?;
        debug!(index, in_flight = self.concurrency.in_flight(), "Scheduler::admit: concurrency admitted");
        if let Some(emitter) = emitter {
            emitter.transition(index, ItemState::ConcurrencyAdmitted);
        }
        Ok(permit)
    }
}

/// Everything a spawned item needs besides the work function and its target
struct ItemTask {
    index: usize,
    batch_start: Instant,
    permit: ConcurrencyPermit,
    cancel: CancellationToken,
    emitter: Option<EventEmitter>,
}

impl ItemTask {
    async fn run<W, T, E, F, Fut>(self, perform: Arc<F>, item: W) -> Settled<T, E>
    where
        F: Fn(W) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let ItemTask {
            index,
            batch_start,
            permit,
            cancel,
            emitter,
        } = self;

        if let Some(emitter) = &emitter {
            emitter.transition(index, ItemState::Running);
        }

        let start = batch_start.elapsed();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ItemError::Cancelled),
            result = (*perform)(item) => result.map_err(ItemError::Failed),
        };
        let end = batch_start.elapsed();

        permit.release();
        Settled {
            index,
            outcome,
            timing: Some(Timing { start, end }),
        }
    }
}

/// Index-addressed outcome slots, each written at most once
struct Collector<T, E> {
    slots: Vec<Option<Settled<T, E>>>,
    tasks: HashMap<Id, usize>,
    emitter: Option<EventEmitter>,
}

impl<T, E> Collector<T, E> {
    fn new(total: usize, emitter: Option<EventEmitter>) -> Self {
        Self {
            slots: (0..total).map(|_| None).collect(),
            tasks: HashMap::new(),
            emitter,
        }
    }

    fn track(&mut self, id: Id, index: usize) {
        self.tasks.insert(id, index);
    }

    fn record(&mut self, joined: Result<(Id, Settled<T, E>), JoinError>) {
        let settled = match joined {
            Ok((id, settled)) => {
                self.tasks.remove(&id);
                settled
            }
            Err(err) => {
                let Some(index) = self.tasks.remove(&err.id()) else {
                    warn!(task_id = %err.id(), "Collector::record: join error for untracked task");
                    return;
                };
                if err.is_panic() {
                    let message = panic_message(err.into_panic());
                    warn!(index, %message, "Work item panicked");
                    Settled {
                        index,
                        outcome: Err(ItemError::Panicked(message)),
                        timing: None,
                    }
                } else {
                    Settled::cancelled(index)
                }
            }
        };
        self.store(settled);
    }

    fn store(&mut self, settled: Settled<T, E>) {
        let index = settled.index;
        let Some(slot) = self.slots.get_mut(index) else {
            warn!(index, "Collector::store: index out of range, ignoring");
            return;
        };
        if slot.is_some() {
            warn!(index, "Collector::store: outcome already recorded, ignoring");
            return;
        }

        debug!(index, success = settled.is_success(), "Collector::store: item settled");
        if let Some(emitter) = &self.emitter {
            emitter.settled(index, settled.is_success());
        }
        *slot = Some(settled);
    }

    /// Every slot, with never-settled items recorded as cancelled
    fn finish(mut self) -> Vec<Settled<T, E>> {
        for index in 0..self.slots.len() {
            if self.slots[index].is_none() {
                self.store(Settled::cancelled(index));
            }
        }
        self.slots.into_iter().flatten().collect()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
