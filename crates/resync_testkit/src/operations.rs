//! Scripted remote operations for dispatcher tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use resync_engine::{RemoteOperation, SyncError, SyncResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// One analysis request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisJob {
    /// Caller-chosen identifier, echoed in the result.
    pub id: u32,
    /// How long the remote call takes.
    pub work: Duration,
}

impl AnalysisJob {
    /// A job taking `work_ms` milliseconds.
    pub fn new(id: u32, work_ms: u64) -> Self {
        Self {
            id,
            work: Duration::from_millis(work_ms),
        }
    }
}

/// The result of an [`AnalysisJob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisScore {
    /// Identifier of the job.
    pub id: u32,
    /// Deterministic fake score.
    pub score: u32,
}

/// A [`RemoteOperation`] that sleeps on the tokio clock and records what ran.
///
/// Failures are scripted per job id; a job with no script succeeds.
#[derive(Debug, Default)]
pub struct ScriptedOperation {
    failures: Mutex<HashMap<u32, Vec<SyncError>>>,
    started: Mutex<Vec<u32>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedOperation {
    /// Creates an operation where every job succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next executions of job `id` fail with `errors`, in order.
    pub fn fail_with(&self, id: u32, errors: Vec<SyncError>) {
        let mut failures = self.failures.lock();
        let script = failures.entry(id).or_default();
        // popped from the back
        script.extend(errors.into_iter().rev());
    }

    /// Makes the next `times` executions of job `id` fail transiently.
    pub fn fail_transiently(&self, id: u32, times: usize) {
        self.fail_with(
            id,
            (0..times)
                .map(|_| SyncError::transient("analysis backend busy"))
                .collect(),
        );
    }

    /// Job ids in the order their executions started.
    pub fn started(&self) -> Vec<u32> {
        self.started.lock().clone()
    }

    /// Highest number of executions observed at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteOperation for ScriptedOperation {
    type Payload = AnalysisJob;
    type Output = AnalysisScore;

    fn validate(&self, payload: &AnalysisJob) -> SyncResult<()> {
        if payload.work.is_zero() {
            return Err(SyncError::validation("analysis job needs a duration"));
        }
        Ok(())
    }

    async fn execute(&self, payload: &AnalysisJob) -> SyncResult<AnalysisScore> {
        self.started.lock().push(payload.id);
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);

        tokio::time::sleep(payload.work).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        let scripted = self
            .failures
            .lock()
            .get_mut(&payload.id)
            .and_then(|script| script.pop());
        match scripted {
            Some(error) => Err(error),
            None => Ok(AnalysisScore {
                id: payload.id,
                score: payload.id * 7 % 100,
            }),
        }
    }
}
