//! Local-first orchestration of the record store, sync queue and cache.

use crate::cache::BoundedCache;
use crate::clock::{Clock, Millis};
use crate::config::EngineConfig;
use crate::error::SyncResult;
use crate::queue::{DrainReport, SyncQueue};
use crate::record::{Record, SyncState};
use crate::sink::ErrorSink;
use crate::store::RecordStore;
use crate::transport::Transport;
use bytes::Bytes;
use parking_lot::Mutex;
use resync_storage::Persistence;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Cumulative sync counters of one [`Reconciler`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Local writes accepted.
    pub writes: u64,
    /// Records that reached Synced.
    pub delivered: u64,
    /// Failed deliveries re-armed with backoff.
    pub retries: u64,
    /// Records that reached Failed.
    pub failures: u64,
    /// Time of the last successful delivery.
    pub last_sync_at: Option<Millis>,
}

struct ReconcilerInner<T: Transport> {
    store: Arc<RecordStore>,
    queue: SyncQueue<T>,
    cache: BoundedCache<Bytes>,
    clock: Arc<dyn Clock>,
    wake: Notify,
    stats: Mutex<SyncStats>,
}

impl<T: Transport> ReconcilerInner<T> {
    fn note(&self, report: &DrainReport) {
        let mut stats = self.stats.lock();
        stats.delivered += report.delivered as u64;
        stats.retries += report.retried as u64;
        stats.failures += report.failed as u64;
        if report.delivered > 0 {
            stats.last_sync_at = Some(self.clock.now());
        }
    }

    async fn drain(&self) -> DrainReport {
        let report = self.queue.drain().await;
        self.note(&report);
        report
    }

    /// Time until the earliest backoff deadline, if anything is queued.
    fn next_wait(&self) -> Option<Duration> {
        let at = self.queue.next_eligible_at()?;
        Some(Duration::from_millis(at.saturating_sub(self.clock.now())))
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("background sync started");
        while !*shutdown.borrow() {
            self.drain().await;

            let wait = self.next_wait();
            let backoff = async {
                match wait {
                    Some(delay) => self.clock.after(delay).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = self.wake.notified() => {}
                _ = backoff => {}
            }
        }
        info!("background sync stopped");
    }
}

/// The engine facade: local-first reads and writes with background sync.
///
/// Writes are persisted synchronously and become readable immediately;
/// delivery to the [`Transport`] happens later, either through
/// [`sync_until_idle`](Reconciler::sync_until_idle) or the loop spawned by
/// [`start`](Reconciler::start).
pub struct Reconciler<T: Transport> {
    inner: Arc<ReconcilerInner<T>>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> Reconciler<T> {
    /// Opens an engine over `persistence` and recovers its pending records.
    ///
    /// Records left Syncing by an interrupted process go back to Dirty, and
    /// every Dirty record is queued again in version order.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an invalid `config`, or a storage
    /// error if the persisted records cannot be read.
    pub fn open(
        config: EngineConfig,
        persistence: Arc<dyn Persistence>,
        transport: T,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn ErrorSink>,
    ) -> SyncResult<Self> {
        config.validate()?;

        let store = Arc::new(RecordStore::new(&config, persistence, Arc::clone(&clock)));
        let queue = SyncQueue::new(
            &config,
            Arc::clone(&store),
            transport,
            Arc::clone(&clock),
            sink,
        );

        let mut pending = Vec::new();
        for record in store.list()? {
            match record.sync_state {
                SyncState::Syncing => {
                    if let Some(record) = store.reset(&record.key)? {
                        pending.push((record.version, record.key));
                    }
                }
                SyncState::Dirty => pending.push((record.version, record.key)),
                SyncState::Synced | SyncState::Failed => {}
            }
        }
        pending.sort();
        for (version, key) in &pending {
            queue.enqueue_with_priority(key, *version);
        }
        if !pending.is_empty() {
            info!(records = pending.len(), "recovered pending records");
        }

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(ReconcilerInner {
                store,
                queue,
                cache: BoundedCache::new(config.max_cache_entries),
                clock,
                wake: Notify::new(),
                stats: Mutex::new(SyncStats::default()),
            }),
            shutdown,
            worker: Mutex::new(None),
        })
    }

    /// Persists `payload` under `key` as Dirty and schedules its delivery.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an invalid key, or a storage error if
    /// the record could not be persisted. Delivery failures never surface
    /// here.
    pub fn write(&self, key: &str, payload: impl Into<Vec<u8>>) -> SyncResult<Record> {
        let record = self.inner.store.put(key, payload.into())?;
        self.inner.queue.enqueue(key);
        self.inner.stats.lock().writes += 1;
        self.inner.wake.notify_one();
        Ok(record)
    }

    /// The latest local record for `key`, whatever its sync state.
    pub fn read(&self, key: &str) -> SyncResult<Option<Record>> {
        self.inner.store.get(key)
    }

    /// Serves `key` from the resource cache, or loads and caches it.
    ///
    /// # Errors
    ///
    /// Propagates the loader's error; nothing is cached in that case.
    pub async fn fetch_resource<F, Fut>(&self, key: &str, loader: F) -> SyncResult<Bytes>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SyncResult<Bytes>>,
    {
        if let Some(value) = self.inner.cache.get(key) {
            return Ok(value);
        }
        let value = loader().await?;
        self.inner.cache.put(key, value.clone());
        Ok(value)
    }

    /// Drains the queue until nothing is waiting or in flight, waiting out
    /// backoff deadlines and deliveries started by the background loop.
    ///
    /// Returns the combined report of the passes this call ran.
    pub async fn sync_until_idle(&self) -> DrainReport {
        let mut total = DrainReport::default();
        loop {
            let settled = self.inner.queue.settled();
            total.merge(self.inner.drain().await);
            match self.inner.next_wait() {
                Some(delay) if !delay.is_zero() => self.inner.clock.after(delay).await,
                Some(_) => {}
                None if self.inner.queue.is_empty() => break,
                None => settled.await,
            }
        }
        total
    }

    /// Spawns the background sync loop on the current tokio runtime.
    ///
    /// The loop drains whenever a write arrives or a backoff deadline
    /// passes. Calling `start` on a running engine does nothing.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        self.shutdown.send_replace(false);
        let receiver = self.shutdown.subscribe();
        *worker = Some(tokio::spawn(Arc::clone(&self.inner).run(receiver)));
    }

    /// Stops the background loop and waits for it to exit.
    ///
    /// A delivery in flight finishes first. Queued records stay persisted
    /// and are picked up again by the next `start` or `open`.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                warn!(error = %e, "background sync task ended abnormally");
            }
        }
    }

    /// Deletes the record for `key` and drops its queued delivery.
    pub fn clear(&self, key: &str) -> SyncResult<bool> {
        self.inner.queue.remove(key);
        let existed = self.inner.store.delete(key)?;
        debug!(key = %key, existed, "record cleared");
        Ok(existed)
    }

    /// Deletes every record of this namespace and user, and empties the
    /// queue and resource cache. Returns the number of records removed.
    pub fn clear_all(&self) -> SyncResult<usize> {
        self.inner.queue.clear();
        self.inner.cache.clear();
        let removed = self.inner.store.clear_all()?;
        info!(removed, "all local records cleared");
        Ok(removed)
    }

    /// Re-arms a Failed record with a fresh retry budget.
    ///
    /// Returns false if `key` is absent or not Failed.
    pub fn retry_failed(&self, key: &str) -> SyncResult<bool> {
        match self.inner.store.get(key)? {
            Some(record) if record.sync_state == SyncState::Failed => {}
            _ => return Ok(false),
        }
        if self.inner.store.reset(key)?.is_none() {
            return Ok(false);
        }
        self.inner.queue.enqueue(key);
        self.inner.wake.notify_one();
        info!(key = %key, "failed record re-armed");
        Ok(true)
    }

    /// Re-arms every Failed record. Returns how many were re-armed.
    pub fn retry_all_failed(&self) -> SyncResult<usize> {
        let mut count = 0;
        for record in self.failed_records()? {
            if self.retry_failed(&record.key)? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Every record in the terminal Failed state.
    pub fn failed_records(&self) -> SyncResult<Vec<Record>> {
        Ok(self
            .inner
            .store
            .list()?
            .into_iter()
            .filter(|record| record.sync_state == SyncState::Failed)
            .collect())
    }

    /// Records queued or in flight.
    pub fn pending(&self) -> usize {
        self.inner.queue.len() + self.inner.queue.in_flight()
    }

    /// Snapshot of the sync counters.
    pub fn stats(&self) -> SyncStats {
        *self.inner.stats.lock()
    }

    /// The resource cache used by [`fetch_resource`](Reconciler::fetch_resource).
    pub fn cache(&self) -> &BoundedCache<Bytes> {
        &self.inner.cache
    }

    /// The underlying record store.
    pub fn store(&self) -> &RecordStore {
        &self.inner.store
    }
}
