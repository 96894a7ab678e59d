//! Time source used for record versions and backoff scheduling.

use async_trait::async_trait;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub type Millis = u64;

/// A clock capability.
///
/// `after` must be a non-blocking wait: it parks the calling task, never a
/// thread.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current wall-clock time in milliseconds.
    fn now(&self) -> Millis;

    /// Completes once `delay` has elapsed.
    async fn after(&self, delay: Duration);
}

/// Clock backed by the tokio timer.
///
/// Wall-clock time is sampled once at construction; afterwards `now()`
/// advances with `tokio::time::Instant`, so a paused tokio runtime
/// (`#[tokio::test(start_paused = true)]`) controls both `now()` and
/// `after()`.
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin_ms: Millis,
    origin: tokio::time::Instant,
}

impl TokioClock {
    /// Creates a clock anchored at the current system time.
    pub fn new() -> Self {
        let origin_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as Millis)
            .unwrap_or_default();
        Self::starting_at(origin_ms)
    }

    /// Creates a clock whose `now()` starts at `origin_ms`.
    pub fn starting_at(origin_ms: Millis) -> Self {
        Self {
            origin_ms,
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Millis {
        self.origin_ms + self.origin.elapsed().as_millis() as Millis
    }

    async fn after(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}
