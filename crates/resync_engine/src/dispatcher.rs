//! Priority-ordered, concurrency-bounded execution of remote jobs.
//!
//! Jobs live in an arena keyed by [`JobId`]; a max-heap of
//! `(priority, Reverse(seq))` entries decides which runs next. Cancelling a
//! queued job removes it from the arena and its heap entry is skipped when
//! popped. Each job owns the sending half of a oneshot channel and the task
//! that computes its outcome sends it directly, so a handle resolves exactly
//! once without anyone polling job state.
//!
//! The queue is closed under its own lock when the dispatcher shuts down.
//! Every push checks that flag under the same lock, so a job is either
//! refused or still queued when the final cancellation pass drains it.

use crate::config::EngineConfig;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::sink::{ErrorSink, FailureKind, FailureReport};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::{oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Identifier of a submitted job.
pub type JobId = u64;

/// An expensive, independently schedulable remote call.
#[async_trait]
pub trait RemoteOperation: Send + Sync + 'static {
    /// Input of one job.
    type Payload: Send + Sync + 'static;
    /// Successful result of one job.
    type Output: Send + 'static;

    /// Rejects malformed payloads before they are queued.
    fn validate(&self, _payload: &Self::Payload) -> SyncResult<()> {
        Ok(())
    }

    /// Runs the remote call.
    async fn execute(&self, payload: &Self::Payload) -> SyncResult<Self::Output>;
}

/// Why a job did not produce a value.
#[derive(Error, Debug)]
pub enum JobError {
    /// The job failed permanently or ran out of retries.
    #[error("job failed after {attempts} attempt(s): {source}")]
    Failed {
        /// Executions attempted.
        attempts: u32,
        /// The last error.
        #[source]
        source: SyncError,
    },

    /// The job was cancelled before it started.
    #[error("job cancelled")]
    Cancelled,
}

/// Completion handle of a submitted job.
///
/// Awaiting it yields the job's outcome. Dropping it does not cancel the job.
#[derive(Debug)]
pub struct JobHandle<T> {
    id: JobId,
    rx: oneshot::Receiver<Result<T, JobError>>,
}

impl<T> JobHandle<T> {
    /// Identifier usable with [`BatchDispatcher::cancel`].
    pub fn id(&self) -> JobId {
        self.id
    }
}

impl<T> Future for JobHandle<T> {
    type Output = Result<T, JobError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // sender dropped without resolving: the runtime went away
            Poll::Ready(Err(_)) => Poll::Ready(Err(JobError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Counters describing dispatcher activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Jobs accepted by `submit`.
    pub submitted: u64,
    /// Jobs resolved with a value.
    pub completed: u64,
    /// Jobs resolved as failed.
    pub failed: u64,
    /// Requeues after a retryable failure.
    pub retried: u64,
    /// Jobs resolved as cancelled.
    pub cancelled: u64,
    /// Highest number of jobs observed executing at once.
    pub peak_in_flight: usize,
}

struct BatchJob<P, O> {
    id: JobId,
    payload: P,
    priority: i64,
    retry_count: u32,
    result_sink: oneshot::Sender<Result<O, JobError>>,
}

impl<P, O> BatchJob<P, O> {
    fn resolve(self, outcome: Result<O, JobError>) {
        // the caller may have dropped its handle
        let _ = self.result_sink.send(outcome);
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry {
    priority: i64,
    seq: Reverse<u64>,
    id: JobId,
}

struct JobQueue<P, O> {
    jobs: HashMap<JobId, BatchJob<P, O>>,
    heap: BinaryHeap<HeapEntry>,
    next_seq: u64,
    /// Set once by shutdown; no job is pushed afterwards.
    closed: bool,
}

impl<P, O> JobQueue<P, O> {
    fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            heap: BinaryHeap::new(),
            next_seq: 0,
            closed: false,
        }
    }

    /// Appends at the tail of the job's priority class.
    fn push(&mut self, job: BatchJob<P, O>) {
        self.next_seq += 1;
        self.heap.push(HeapEntry {
            priority: job.priority,
            seq: Reverse(self.next_seq),
            id: job.id,
        });
        self.jobs.insert(job.id, job);
    }

    fn pop(&mut self) -> Option<BatchJob<P, O>> {
        while let Some(entry) = self.heap.pop() {
            if let Some(job) = self.jobs.remove(&entry.id) {
                return Some(job);
            }
        }
        None
    }

    fn drain(&mut self) -> Vec<BatchJob<P, O>> {
        self.heap.clear();
        self.jobs.drain().map(|(_, job)| job).collect()
    }
}

struct DispatcherInner<O: RemoteOperation> {
    operation: O,
    sink: Arc<dyn ErrorSink>,
    max_retries: u32,
    batch_size: usize,
    permits: Arc<Semaphore>,
    queue: Mutex<JobQueue<O::Payload, O::Output>>,
    wake: Notify,
    shutdown: AtomicBool,
    in_flight: AtomicUsize,
    next_id: AtomicU64,
    stats: Mutex<DispatcherStats>,
}

impl<O: RemoteOperation> DispatcherInner<O> {
    async fn run_scheduler(self: Arc<Self>) {
        let mut workers = JoinSet::new();
        info!("batch dispatcher started");

        while !self.shutdown.load(Ordering::SeqCst) {
            let mut pulled = 0;
            while pulled < self.batch_size {
                let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                    break;
                };
                let Some(job) = self.queue.lock().pop() else {
                    break;
                };
                pulled += 1;
                debug!(job = job.id, priority = job.priority, "dispatching job");
                workers.spawn(Arc::clone(&self).run_job(job, permit));
            }

            tokio::select! {
                _ = self.wake.notified() => {}
                Some(_) = workers.join_next(), if !workers.is_empty() => {}
            }
        }

        while workers.join_next().await.is_some() {}
        self.cancel_queued();
        info!("batch dispatcher stopped");
    }

    async fn run_job(
        self: Arc<Self>,
        mut job: BatchJob<O::Payload, O::Output>,
        permit: OwnedSemaphorePermit,
    ) {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut stats = self.stats.lock();
            stats.peak_in_flight = stats.peak_in_flight.max(running);
        }

        let outcome = AssertUnwindSafe(self.operation.execute(&job.payload))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(SyncError::permanent("remote operation panicked")));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        drop(permit);

        match outcome {
            Ok(value) => {
                self.stats.lock().completed += 1;
                job.resolve(Ok(value));
            }
            Err(error) => {
                let retry = match error.kind() {
                    ErrorKind::Transient | ErrorKind::Capacity => job.retry_count < self.max_retries,
                    ErrorKind::Validation | ErrorKind::Permanent | ErrorKind::Cancelled => false,
                };
                let mut queue = self.queue.lock();
                if retry && !queue.closed {
                    job.retry_count += 1;
                    warn!(job = job.id, retry = job.retry_count, error = %error, "job failed, requeueing");
                    queue.push(job);
                    drop(queue);
                    self.stats.lock().retried += 1;
                } else {
                    drop(queue);
                    self.fail(job, error);
                }
            }
        }

        self.wake.notify_one();
    }

    fn fail(&self, job: BatchJob<O::Payload, O::Output>, error: SyncError) {
        let attempts = job.retry_count + 1;
        self.sink.report(FailureReport {
            kind: FailureKind::JobFailure,
            context: format!("job-{}", job.id),
            error_kind: error.kind(),
            message: error.to_string(),
            attempts,
        });
        self.stats.lock().failed += 1;
        job.resolve(Err(JobError::Failed {
            attempts,
            source: error,
        }));
    }

    fn cancel_queued(&self) {
        let jobs = {
            let mut queue = self.queue.lock();
            queue.closed = true;
            queue.drain()
        };
        self.stats.lock().cancelled += jobs.len() as u64;
        for job in jobs {
            job.resolve(Err(JobError::Cancelled));
        }
    }
}

/// Bounded worker pool running [`RemoteOperation`] jobs by priority.
///
/// Jobs submitted before [`start`](BatchDispatcher::start) wait in the queue.
/// Higher priorities run first; equal priorities run in submission order.
/// A failed job goes back to the tail of its priority class while it has
/// retries left.
pub struct BatchDispatcher<O: RemoteOperation> {
    inner: Arc<DispatcherInner<O>>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl<O: RemoteOperation> BatchDispatcher<O> {
    /// Creates a stopped dispatcher.
    pub fn new(config: &EngineConfig, operation: O, sink: Arc<dyn ErrorSink>) -> Self {
        let concurrency = config.batch_concurrency.max(1);
        Self {
            inner: Arc::new(DispatcherInner {
                operation,
                sink,
                max_retries: config.max_retries,
                batch_size: config.batch_size.max(1),
                permits: Arc::new(Semaphore::new(concurrency)),
                queue: Mutex::new(JobQueue::new()),
                wake: Notify::new(),
                shutdown: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
                stats: Mutex::new(DispatcherStats::default()),
            }),
            scheduler: Mutex::new(None),
        }
    }

    /// Queues a job. Higher `priority` runs first.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the payload is rejected by
    /// [`RemoteOperation::validate`] or the dispatcher has shut down.
    pub fn submit(
        &self,
        payload: O::Payload,
        priority: i64,
    ) -> SyncResult<JobHandle<O::Output>> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(SyncError::Shutdown);
        }
        self.inner.operation.validate(&payload)?;

        let id: JobId = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut queue = self.inner.queue.lock();
            if queue.closed {
                return Err(SyncError::Shutdown);
            }
            queue.push(BatchJob {
                id,
                payload,
                priority,
                retry_count: 0,
                result_sink: tx,
            });
        }
        self.inner.stats.lock().submitted += 1;
        self.inner.wake.notify_one();
        debug!(job = id, priority, "job submitted");

        Ok(JobHandle { id, rx })
    }

    /// Removes a job that has not started yet and resolves it as cancelled.
    ///
    /// Returns false if the job is unknown, running or already resolved.
    pub fn cancel(&self, id: JobId) -> bool {
        let Some(job) = self.inner.queue.lock().jobs.remove(&id) else {
            return false;
        };
        self.inner.stats.lock().cancelled += 1;
        job.resolve(Err(JobError::Cancelled));
        true
    }

    /// Spawns the scheduler on the current tokio runtime. Idempotent.
    pub fn start(&self) {
        let mut scheduler = self.scheduler.lock();
        if scheduler.is_none() && !self.inner.shutdown.load(Ordering::SeqCst) {
            *scheduler = Some(tokio::spawn(Arc::clone(&self.inner).run_scheduler()));
        }
    }

    /// Stops scheduling, waits for running jobs, and cancels queued ones.
    pub async fn shutdown(&self) {
        self.inner.queue.lock().closed = true;
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
        let scheduler = self.scheduler.lock().take();
        match scheduler {
            Some(handle) => {
                if let Err(e) = handle.await {
                    warn!(error = %e, "batch scheduler task ended abnormally");
                }
            }
            None => self.inner.cancel_queued(),
        }
    }

    /// Jobs waiting to run.
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().jobs.len()
    }

    /// Jobs currently executing.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> DispatcherStats {
        *self.inner.stats.lock()
    }

    /// The wrapped operation.
    pub fn operation(&self) -> &O {
        &self.inner.operation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemoryErrorSink;
    use std::time::Duration;

    /// Sleeps for `payload.1` ms, then fails while `payload.0` failures remain.
    struct Flaky {
        failures: Mutex<HashMap<u32, u32>>,
        order: Mutex<Vec<u32>>,
        permanent: bool,
        crash_on: Mutex<Option<u32>>,
    }

    impl Flaky {
        fn new(permanent: bool) -> Self {
            Self {
                failures: Mutex::new(HashMap::new()),
                order: Mutex::new(Vec::new()),
                permanent,
                crash_on: Mutex::new(None),
            }
        }

        fn crash_on(&self, job: u32) {
            *self.crash_on.lock() = Some(job);
        }

        fn fail_times(&self, job: u32, times: u32) {
            self.failures.lock().insert(job, times);
        }
    }

    #[async_trait]
    impl RemoteOperation for Flaky {
        type Payload = (u32, u64);
        type Output = u32;

        fn validate(&self, payload: &Self::Payload) -> SyncResult<()> {
            if payload.0 == 0 {
                return Err(SyncError::validation("job 0 is reserved"));
            }
            Ok(())
        }

        async fn execute(&self, payload: &Self::Payload) -> SyncResult<u32> {
            self.order.lock().push(payload.0);
            tokio::time::sleep(Duration::from_millis(payload.1)).await;
            if *self.crash_on.lock() == Some(payload.0) {
                panic!("analysis worker crashed on job {}", payload.0);
            }
            let mut failures = self.failures.lock();
            if let Some(left) = failures.get_mut(&payload.0) {
                if *left > 0 {
                    *left -= 1;
                    return Err(if self.permanent {
                        SyncError::permanent("unscorable audio")
                    } else {
                        SyncError::transient("analysis backend busy")
                    });
                }
            }
            Ok(payload.0 * 10)
        }
    }

    fn dispatcher(
        concurrency: usize,
        operation: Flaky,
    ) -> (BatchDispatcher<Flaky>, Arc<MemoryErrorSink>) {
        let sink = Arc::new(MemoryErrorSink::new());
        let config = EngineConfig::default()
            .with_batch_concurrency(concurrency)
            .with_max_retries(2);
        (BatchDispatcher::new(&config, operation, sink.clone()), sink)
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_with_value() {
        let (dispatcher, _) = dispatcher(2, Flaky::new(false));
        dispatcher.start();

        let handle = dispatcher.submit((7, 10), 1).unwrap();
        assert_eq!(handle.await.unwrap(), 70);
        assert_eq!(dispatcher.stats().completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn validation_is_synchronous() {
        let (dispatcher, _) = dispatcher(2, Flaky::new(false));
        assert!(matches!(
            dispatcher.submit((0, 0), 1),
            Err(SyncError::Validation(_))
        ));
        assert_eq!(dispatcher.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn higher_priority_runs_first() {
        let (dispatcher, _) = dispatcher(1, Flaky::new(false));
        let low = dispatcher.submit((1, 10), 1).unwrap();
        let high = dispatcher.submit((2, 10), 9).unwrap();
        let mid = dispatcher.submit((3, 10), 5).unwrap();
        dispatcher.start();

        let _ = tokio::join!(low, high, mid);
        assert_eq!(*dispatcher.inner.operation.order.lock(), vec![2, 3, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_at_the_tail() {
        let operation = Flaky::new(false);
        operation.fail_times(1, 1);
        let (dispatcher, sink) = dispatcher(1, operation);

        let first = dispatcher.submit((1, 10), 5).unwrap();
        let second = dispatcher.submit((2, 10), 5).unwrap();
        dispatcher.start();

        assert_eq!(first.await.unwrap(), 10);
        assert_eq!(second.await.unwrap(), 20);
        // job 1 failed, went behind job 2, then succeeded
        assert_eq!(*dispatcher.inner.operation.order.lock(), vec![1, 2, 1]);
        assert_eq!(dispatcher.stats().retried, 1);
        assert!(sink.reports().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_resolve_as_failed() {
        let operation = Flaky::new(false);
        operation.fail_times(1, 10);
        let (dispatcher, sink) = dispatcher(1, operation);
        dispatcher.start();

        let err = dispatcher.submit((1, 1), 1).unwrap().await.unwrap_err();
        assert!(matches!(err, JobError::Failed { attempts: 3, .. }));

        let reports = sink.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].kind, FailureKind::JobFailure);
        assert_eq!(reports[0].attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_are_not_retried() {
        let operation = Flaky::new(true);
        operation.fail_times(1, 1);
        let (dispatcher, sink) = dispatcher(1, operation);
        dispatcher.start();

        let err = dispatcher.submit((1, 1), 1).unwrap().await.unwrap_err();
        assert!(matches!(err, JobError::Failed { attempts: 1, .. }));
        assert_eq!(dispatcher.stats().retried, 0);
        assert_eq!(sink.reports().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_concurrency() {
        let (dispatcher, _) = dispatcher(3, Flaky::new(false));
        let handles: Vec<_> = (1..=12)
            .map(|i| dispatcher.submit((i, 20 + u64::from(i % 4) * 5), 1).unwrap())
            .collect();
        dispatcher.start();

        for handle in handles {
            handle.await.unwrap();
        }
        let stats = dispatcher.stats();
        assert_eq!(stats.peak_in_flight, 3);
        assert_eq!(stats.completed, 12);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_start() {
        let (dispatcher, _) = dispatcher(1, Flaky::new(false));
        let keep = dispatcher.submit((1, 1), 1).unwrap();
        let drop_me = dispatcher.submit((2, 1), 1).unwrap();

        assert!(dispatcher.cancel(drop_me.id()));
        assert!(!dispatcher.cancel(drop_me.id()));
        dispatcher.start();

        assert!(matches!(drop_me.await, Err(JobError::Cancelled)));
        assert_eq!(keep.await.unwrap(), 10);
        assert_eq!(*dispatcher.inner.operation.order.lock(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_queued_and_finishes_running() {
        let (dispatcher, _) = dispatcher(1, Flaky::new(false));
        let running = dispatcher.submit((1, 100), 9).unwrap();
        let queued = dispatcher.submit((2, 100), 1).unwrap();
        dispatcher.start();
        tokio::time::sleep(Duration::from_millis(10)).await;

        dispatcher.shutdown().await;

        assert_eq!(running.await.unwrap(), 10);
        assert!(matches!(queued.await, Err(JobError::Cancelled)));
        assert!(matches!(
            dispatcher.submit((3, 1), 1),
            Err(SyncError::Shutdown)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_job_fails_and_releases_its_slot() {
        let operation = Flaky::new(false);
        operation.crash_on(1);
        let (dispatcher, sink) = dispatcher(1, operation);
        dispatcher.start();

        let crashed = dispatcher.submit((1, 5), 9).unwrap();
        let next = dispatcher.submit((2, 5), 1).unwrap();

        let err = crashed.await.unwrap_err();
        assert!(matches!(
            err,
            JobError::Failed {
                attempts: 1,
                source: SyncError::Permanent(_),
            }
        ));
        assert_eq!(next.await.unwrap(), 20);
        assert_eq!(dispatcher.in_flight(), 0);

        let reports = sink.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].kind, FailureKind::JobFailure);
        assert_eq!(dispatcher.stats().failed, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn submit_racing_shutdown_never_strands_a_handle() {
        for _ in 0..50 {
            let (dispatcher, _) = dispatcher(2, Flaky::new(false));
            let dispatcher = Arc::new(dispatcher);
            dispatcher.start();

            let submitters: Vec<_> = (1..=4u32)
                .map(|t| {
                    let dispatcher = Arc::clone(&dispatcher);
                    tokio::spawn(async move {
                        let mut handles = Vec::new();
                        for i in 0..25 {
                            match dispatcher.submit((t * 100 + i, 0), 1) {
                                Ok(handle) => handles.push(handle),
                                Err(e) => {
                                    assert!(matches!(e, SyncError::Shutdown));
                                    break;
                                }
                            }
                            tokio::task::yield_now().await;
                        }
                        handles
                    })
                })
                .collect();

            tokio::task::yield_now().await;
            dispatcher.shutdown().await;

            for submitter in submitters {
                for handle in submitter.await.unwrap() {
                    let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
                        .await
                        .expect("handle left unresolved after shutdown");
                    assert!(matches!(outcome, Ok(_) | Err(JobError::Cancelled)));
                }
            }
            assert!(matches!(
                dispatcher.submit((1, 0), 1),
                Err(SyncError::Shutdown)
            ));
        }
    }
}
