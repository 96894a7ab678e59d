//! Transport abstraction used by the sync queue.

use crate::clock::{Clock, Millis, TokioClock};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A transport delivers one record payload to the remote store.
///
/// Implementations classify failures through the returned [`SyncError`]:
/// transient, rate-limit and timeout errors are retried with backoff,
/// permanent and validation errors fail the record immediately.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends the latest payload for `key`.
    async fn send(&self, key: &str, payload: &[u8]) -> SyncResult<()>;
}

#[async_trait]
impl<T: Transport> Transport for Arc<T> {
    async fn send(&self, key: &str, payload: &[u8]) -> SyncResult<()> {
        (**self).send(key, payload).await
    }
}

/// One observed call to [`MockTransport::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentCall {
    /// Record key.
    pub key: String,
    /// Payload as sent.
    pub payload: Vec<u8>,
    /// Clock time when the call started.
    pub at: Millis,
}

/// A scripted transport for testing.
///
/// Outcomes are queued per key; a key with an empty script succeeds.
/// Successful payloads are kept as the simulated remote copy.
pub struct MockTransport {
    clock: Arc<dyn Clock>,
    connected: AtomicBool,
    latency: Mutex<Duration>,
    scripts: Mutex<HashMap<String, VecDeque<SyncError>>>,
    calls: Mutex<Vec<SentCall>>,
    remote: Mutex<HashMap<String, Vec<u8>>>,
}

impl MockTransport {
    /// Creates a connected mock transport timed by a [`TokioClock`].
    pub fn new() -> Self {
        Self::with_clock(Arc::new(TokioClock::new()))
    }

    /// Creates a mock transport that timestamps calls with `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            connected: AtomicBool::new(true),
            latency: Mutex::new(Duration::ZERO),
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            remote: Mutex::new(HashMap::new()),
        }
    }

    /// Makes the next delivery of `key` fail with `error`.
    pub fn fail_next(&self, key: &str, error: SyncError) {
        self.scripts
            .lock()
            .entry(key.to_owned())
            .or_default()
            .push_back(error);
    }

    /// Makes the next `times` deliveries of `key` fail with errors built by `make`.
    pub fn fail_times(&self, key: &str, times: usize, make: impl Fn() -> SyncError) {
        for _ in 0..times {
            self.fail_next(key, make());
        }
    }

    /// Simulates losing (or regaining) connectivity. While disconnected
    /// every call fails with a transient error.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Makes every call take `latency` before answering.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Every call observed so far, in start order.
    pub fn calls(&self) -> Vec<SentCall> {
        self.calls.lock().clone()
    }

    /// Calls observed for `key`.
    pub fn calls_for(&self, key: &str) -> Vec<SentCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.key == key)
            .cloned()
            .collect()
    }

    /// The last successfully delivered payload for `key`.
    pub fn remote_value(&self, key: &str) -> Option<Vec<u8>> {
        self.remote.lock().get(key).cloned()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, key: &str, payload: &[u8]) -> SyncResult<()> {
        self.calls.lock().push(SentCall {
            key: key.to_owned(),
            payload: payload.to_vec(),
            at: self.clock.now(),
        });

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            self.clock.after(latency).await;
        }

        if !self.connected.load(Ordering::SeqCst) {
            return Err(SyncError::transient("not connected"));
        }

        let scripted = self
            .scripts
            .lock()
            .get_mut(key)
            .and_then(VecDeque::pop_front);
        if let Some(error) = scripted {
            return Err(error);
        }

        self.remote.lock().insert(key.to_owned(), payload.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_transport_scripted_failures() {
        let transport = MockTransport::new();
        transport.fail_times("a", 2, || SyncError::transient("flaky"));

        assert!(transport.send("a", b"1").await.is_err());
        assert!(transport.send("a", b"2").await.is_err());
        assert!(transport.send("a", b"3").await.is_ok());

        assert_eq!(transport.calls_for("a").len(), 3);
        assert_eq!(transport.remote_value("a").unwrap(), b"3");
    }

    #[tokio::test]
    async fn mock_transport_disconnected() {
        let transport = MockTransport::new();
        transport.set_connected(false);

        let err = transport.send("a", b"x").await.unwrap_err();
        assert!(err.is_retryable());
        assert!(transport.remote_value("a").is_none());

        transport.set_connected(true);
        transport.send("a", b"x").await.unwrap();
        assert_eq!(transport.remote_value("a").unwrap(), b"x");
    }

    #[tokio::test]
    async fn scripts_are_per_key() {
        let transport = MockTransport::new();
        transport.fail_next("a", SyncError::permanent("schema"));

        assert!(transport.send("b", b"x").await.is_ok());
        assert!(matches!(
            transport.send("a", b"x").await,
            Err(SyncError::Permanent(_))
        ));
    }
}
