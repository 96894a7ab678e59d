//! Engine fixtures.
//!
//! A [`TestHarness`] owns a [`Reconciler`] together with handles on every
//! mock capability it was built from, so tests can script the transport and
//! inspect the persisted state and error reports.

use resync_engine::{
    Clock, EngineConfig, MemoryErrorSink, Millis, MockTransport, Reconciler, Record, SyncState,
    TokioClock,
};
use resync_storage::{FilePersistence, InMemoryPersistence, Persistence};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tempfile::TempDir;

/// Wall-clock time every harness clock starts at.
pub const HARNESS_EPOCH_MS: Millis = 1_700_000_000_000;

/// An engine wired to in-memory capabilities.
pub struct TestHarness {
    /// Configuration the engine was opened with.
    pub config: EngineConfig,
    /// Clock shared by the engine and the transport.
    pub clock: Arc<dyn Clock>,
    /// Backing storage.
    pub persistence: Arc<dyn Persistence>,
    /// Scripted remote endpoint.
    pub transport: Arc<MockTransport>,
    /// Collected terminal failures.
    pub sink: Arc<MemoryErrorSink>,
    /// The engine under test.
    pub engine: Reconciler<Arc<MockTransport>>,
    _temp_dir: Option<TempDir>,
}

impl TestHarness {
    /// Creates a harness with the default configuration.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Creates an in-memory harness with `config`.
    pub fn with_config(config: EngineConfig) -> Self {
        Self::build(config, Arc::new(InMemoryPersistence::new()), None)
    }

    /// Creates a harness persisting into a temporary directory.
    pub fn on_disk(config: EngineConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let persistence =
            FilePersistence::open(temp_dir.path()).expect("Failed to open file persistence");
        Self::build(config, Arc::new(persistence), Some(temp_dir))
    }

    fn build(
        config: EngineConfig,
        persistence: Arc<dyn Persistence>,
        temp_dir: Option<TempDir>,
    ) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::starting_at(HARNESS_EPOCH_MS));
        let transport = Arc::new(MockTransport::with_clock(Arc::clone(&clock)));
        let sink = Arc::new(MemoryErrorSink::new());
        let engine = Reconciler::open(
            config.clone(),
            Arc::clone(&persistence),
            Arc::clone(&transport),
            Arc::clone(&clock),
            sink.clone(),
        )
        .expect("Failed to open engine");

        Self {
            config,
            clock,
            persistence,
            transport,
            sink,
            engine,
            _temp_dir: temp_dir,
        }
    }

    /// Opens a second engine over the same storage, as after a restart.
    ///
    /// The new engine gets a fresh transport and sink. Only valid for
    /// in-memory harnesses: a file-backed directory stays locked by `self`.
    pub fn reopen(&self) -> Self {
        Self::build(self.config.clone(), Arc::clone(&self.persistence), None)
    }

    /// The stored record for `key`.
    pub fn record(&self, key: &str) -> Option<Record> {
        self.engine.read(key).expect("Failed to read record")
    }

    /// The sync state of `key`.
    pub fn state(&self, key: &str) -> Option<SyncState> {
        self.record(key).map(|record| record.sync_state)
    }

    /// Milliseconds between consecutive sends of `key`.
    pub fn send_gaps(&self, key: &str) -> Vec<Millis> {
        self.transport
            .calls_for(key)
            .windows(2)
            .map(|pair| pair[1].at - pair[0].at)
            .collect()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// A progress record payload as an application would write it.
pub fn progress_payload(score: u32) -> Vec<u8> {
    serde_json::to_vec(&json!({ "score": score })).expect("Failed to encode payload")
}

/// Runs `future` on a current-thread runtime with paused time.
///
/// For property tests, which cannot be `#[tokio::test]` functions.
pub fn block_on_paused<F: Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .expect("Failed to build runtime")
        .block_on(future)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn harness_clock_starts_at_epoch() {
        let harness = TestHarness::new();
        assert_eq!(harness.clock.now(), HARNESS_EPOCH_MS);
    }

    #[tokio::test(start_paused = true)]
    async fn reopen_shares_storage() {
        let harness = TestHarness::new();
        harness.engine.write("k", progress_payload(1)).unwrap();

        let restarted = harness.reopen();
        assert_eq!(restarted.state("k"), Some(SyncState::Dirty));
        assert_eq!(restarted.engine.pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn on_disk_harness_persists() {
        let harness = TestHarness::on_disk(EngineConfig::default());
        harness.engine.write("k", progress_payload(2)).unwrap();
        harness.engine.sync_until_idle().await;
        assert_eq!(harness.state("k"), Some(SyncState::Synced));
    }

    #[test]
    fn progress_payload_is_json() {
        assert_eq!(progress_payload(80), br#"{"score":80}"#.to_vec());
    }
}
