//! Per-key ordered delivery of Dirty records.
//!
//! The queue holds at most one [`QueueItem`] per key and never carries a
//! payload: every delivery re-reads the latest record from the
//! [`RecordStore`], so writes that land before an item is processed are
//! coalesced into one send of the newest value. A key is never delivered by
//! two tasks at once; writes that arrive while a delivery is in flight
//! re-arm the key once that delivery settles.

use crate::clock::{Clock, Millis};
use crate::config::EngineConfig;
use crate::error::{ErrorKind, SyncError};
use crate::record::Record;
use crate::sink::{ErrorSink, FailureKind, FailureReport};
use crate::store::RecordStore;
use crate::transport::Transport;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Scheduling wrapper for one Dirty record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    /// Record key.
    pub key: String,
    /// When the key was first queued.
    pub enqueued_at: Millis,
    /// Earliest time the next delivery may start.
    pub next_eligible_at: Millis,
    /// Lower values are delivered first. Defaults to the enqueue time (FIFO).
    pub priority: u64,
    seq: u64,
}

/// Outcome counters of one or more [`SyncQueue::drain`] passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Records that reached Synced.
    pub delivered: usize,
    /// Transient failures re-armed with backoff.
    pub retried: usize,
    /// Records that reached Failed.
    pub failed: usize,
    /// Deliveries overtaken by a newer local write.
    pub superseded: usize,
    /// Items whose record was deleted or no longer pending.
    pub dropped: usize,
    /// Local storage failures re-armed with the fixed capacity delay.
    pub deferred: usize,
}

impl DrainReport {
    /// Adds the counters of `other` to this report.
    pub fn merge(&mut self, other: DrainReport) {
        self.delivered += other.delivered;
        self.retried += other.retried;
        self.failed += other.failed;
        self.superseded += other.superseded;
        self.dropped += other.dropped;
        self.deferred += other.deferred;
    }

    /// Total number of deliveries processed.
    pub fn processed(&self) -> usize {
        self.delivered + self.retried + self.failed + self.superseded + self.dropped + self.deferred
    }

    fn record(&mut self, delivery: &Delivery) {
        match delivery {
            Delivery::Delivered => self.delivered += 1,
            Delivery::Retried { .. } => self.retried += 1,
            Delivery::Failed => self.failed += 1,
            Delivery::Superseded => self.superseded += 1,
            Delivery::Dropped => self.dropped += 1,
            Delivery::Deferred { .. } => self.deferred += 1,
        }
    }
}

#[derive(Debug)]
enum Delivery {
    Delivered,
    Retried { attempt: u32, delay: Duration },
    Failed,
    Superseded,
    Dropped,
    Deferred { delay: Duration },
}

#[derive(Default)]
struct QueueState {
    items: HashMap<String, QueueItem>,
    order: BTreeMap<(u64, u64), String>,
    in_flight: HashSet<String>,
    rearm: HashSet<String>,
    next_seq: u64,
}

impl QueueState {
    fn insert(&mut self, mut item: QueueItem) {
        self.next_seq += 1;
        item.seq = self.next_seq;
        self.order.insert((item.priority, item.seq), item.key.clone());
        self.items.insert(item.key.clone(), item);
    }

    fn remove(&mut self, key: &str) -> Option<QueueItem> {
        let item = self.items.remove(key)?;
        self.order.remove(&(item.priority, item.seq));
        Some(item)
    }
}

/// Delivery pipeline draining Dirty records into a [`Transport`].
pub struct SyncQueue<T: Transport> {
    config: EngineConfig,
    store: Arc<RecordStore>,
    transport: T,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn ErrorSink>,
    state: Mutex<QueueState>,
    settled: Notify,
}

impl<T: Transport> SyncQueue<T> {
    /// Creates an empty queue.
    pub fn new(
        config: &EngineConfig,
        store: Arc<RecordStore>,
        transport: T,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            config: config.clone(),
            store,
            transport,
            clock,
            sink,
            state: Mutex::new(QueueState::default()),
            settled: Notify::new(),
        }
    }

    /// Schedules `key` for delivery with FIFO priority.
    pub fn enqueue(&self, key: &str) {
        let now = self.clock.now();
        self.enqueue_with_priority(key, now);
    }

    /// Schedules `key` for delivery; lower `priority` values go first.
    ///
    /// If the key is already queued its scheduling (priority, backoff
    /// deadline) is kept; the next delivery reads the newest record anyway.
    pub fn enqueue_with_priority(&self, key: &str, priority: u64) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if state.in_flight.contains(key) {
            debug!(key = %key, "delivery in flight, re-arming after it settles");
            state.rearm.insert(key.to_owned());
            return;
        }
        if state.items.contains_key(key) {
            debug!(key = %key, "already queued, scheduling preserved");
            return;
        }
        state.insert(QueueItem {
            key: key.to_owned(),
            enqueued_at: now,
            next_eligible_at: now,
            priority,
            seq: 0,
        });
    }

    /// Drops the pending item for `key`. An in-flight delivery still
    /// settles but is not re-armed by earlier writes.
    pub fn remove(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        state.rearm.remove(key);
        state.remove(key).is_some()
    }

    /// Drops every pending item.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.items.clear();
        state.order.clear();
        state.rearm.clear();
    }

    /// The scheduling state of `key`, if queued.
    pub fn item(&self, key: &str) -> Option<QueueItem> {
        self.state.lock().items.get(key).cloned()
    }

    /// Number of items waiting (excluding in-flight deliveries).
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Returns true if nothing is waiting and nothing is in flight.
    pub fn is_empty(&self) -> bool {
        let state = self.state.lock();
        state.items.is_empty() && state.in_flight.is_empty()
    }

    /// Number of deliveries currently in flight.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Resolves once a delivery settles after this call.
    ///
    /// Create it before checking [`is_empty`](Self::is_empty) so a delivery
    /// finishing in between is not missed.
    pub fn settled(&self) -> Notified<'_> {
        self.settled.notified()
    }

    /// Earliest deadline among waiting items.
    pub fn next_eligible_at(&self) -> Option<Millis> {
        self.state
            .lock()
            .items
            .values()
            .map(|item| item.next_eligible_at)
            .min()
    }

    /// Delivers every item that is eligible now, in priority order.
    ///
    /// Up to `sync_fan_out` distinct keys are in flight at once; a finished
    /// slot immediately takes the next eligible item. Items re-armed with a
    /// future deadline are left for a later pass. Returns once nothing is
    /// eligible and nothing this pass started is still running.
    pub async fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();
        let mut running = FuturesUnordered::new();

        loop {
            while running.len() < self.config.sync_fan_out {
                match self.take_eligible(self.clock.now()) {
                    Some(item) => running.push(self.process(item)),
                    None => break,
                }
            }
            match running.next().await {
                Some(delivery) => report.record(&delivery),
                None => break,
            }
        }

        if report.processed() > 0 {
            debug!(?report, "drain pass finished");
        }
        report
    }

    fn take_eligible(&self, now: Millis) -> Option<QueueItem> {
        let mut state = self.state.lock();
        let slot = state
            .order
            .iter()
            .find(|(_, key)| {
                state
                    .items
                    .get(*key)
                    .is_some_and(|item| item.next_eligible_at <= now)
            })
            .map(|(slot, _)| *slot)?;
        let key = state.order.remove(&slot)?;
        let item = state.items.remove(&key)?;
        state.in_flight.insert(key);
        Some(item)
    }

    async fn process(&self, item: QueueItem) -> Delivery {
        let delivery = self.deliver(&item.key).await;
        self.settle(item, &delivery);
        delivery
    }

    async fn deliver(&self, key: &str) -> Delivery {
        let record = match self.store.get(key) {
            Ok(Some(record)) if record.sync_state.is_pending() => record,
            Ok(_) => return Delivery::Dropped,
            Err(e) => return self.defer(key, &e),
        };
        if let Err(e) = self.store.mark_syncing(key, record.version) {
            return self.defer(key, &e);
        }

        match self.transport.send(key, &record.payload).await {
            Ok(()) => match self.store.mark_synced(key, record.version) {
                Ok(true) => {
                    info!(key = %key, version = record.version, "record synced");
                    Delivery::Delivered
                }
                Ok(false) => Delivery::Superseded,
                Err(e) => self.defer(key, &e),
            },
            Err(error) => self.handle_failure(&record, error),
        }
    }

    fn handle_failure(&self, record: &Record, error: SyncError) -> Delivery {
        let key = record.key.as_str();
        if error.kind() == ErrorKind::Capacity {
            return self.defer(key, &error);
        }

        let message = error.to_string();
        let attempt = match self.store.record_failure(key, record.version, &message) {
            Ok(Some(attempt)) => attempt,
            Ok(None) => return Delivery::Superseded,
            Err(e) => return self.defer(key, &e),
        };

        let retry = match error.kind() {
            ErrorKind::Transient => attempt <= self.config.max_retries,
            ErrorKind::Validation
            | ErrorKind::Permanent
            | ErrorKind::Capacity
            | ErrorKind::Cancelled => false,
        };
        if retry {
            let delay = self.config.backoff_delay(attempt);
            warn!(
                key = %key,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "delivery failed, retrying"
            );
            return Delivery::Retried { attempt, delay };
        }

        match self.store.mark_failed(key, record.version, &message) {
            Ok(true) => {
                info!(key = %key, attempt, error = %message, "record failed");
                self.sink.report(FailureReport {
                    kind: FailureKind::PermanentFailure,
                    context: key.to_owned(),
                    error_kind: error.kind(),
                    message,
                    attempts: attempt,
                });
                Delivery::Failed
            }
            Ok(false) => Delivery::Superseded,
            Err(e) => self.defer(key, &e),
        }
    }

    fn defer(&self, key: &str, error: &SyncError) -> Delivery {
        let delay = self.config.capacity_retry_delay;
        warn!(
            key = %key,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "local storage failure, deferring delivery"
        );
        Delivery::Deferred { delay }
    }

    fn settle(&self, mut item: QueueItem, delivery: &Delivery) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.in_flight.remove(&item.key);
        let rearm = state.rearm.remove(&item.key);

        let next_eligible_at = match delivery {
            Delivery::Retried { delay, .. } | Delivery::Deferred { delay } => {
                Some(now + delay.as_millis() as Millis)
            }
            Delivery::Superseded => Some(item.next_eligible_at.min(now)),
            Delivery::Delivered | Delivery::Failed | Delivery::Dropped => rearm.then_some(now),
        };

        if let Some(at) = next_eligible_at {
            if let Delivery::Retried { attempt, .. } = delivery {
                debug!(key = %item.key, attempt, next_eligible_at = at, "re-armed with backoff");
            }
            item.next_eligible_at = at;
            state.insert(item);
        }
        drop(state);
        self.settled.notify_waiters();
    }
}
