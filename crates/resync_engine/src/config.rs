//! Configuration for the sync engine.

use crate::error::{SyncError, SyncResult};
use std::time::Duration;

/// Configuration shared by the record store, sync queue, cache and
/// batch dispatcher.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Application-chosen namespace prefixed to every persisted key.
    pub namespace: String,
    /// Identifier of the signed-in user, supplied by the identity layer.
    pub user_id: String,
    /// Retries allowed after the first failed delivery or job execution.
    pub max_retries: u32,
    /// Backoff delay after the first failed delivery.
    pub base_delay: Duration,
    /// Upper bound on the backoff delay.
    pub max_delay: Duration,
    /// Fixed delay before retrying after a local storage failure.
    pub capacity_retry_delay: Duration,
    /// Capacity of the resource cache (sum of entry costs).
    pub max_cache_entries: usize,
    /// Number of batch jobs allowed to run concurrently.
    pub batch_concurrency: usize,
    /// Maximum number of jobs pulled per scheduling tick.
    pub batch_size: usize,
    /// Number of distinct keys the sync queue may deliver concurrently.
    pub sync_fan_out: usize,
    /// Maximum length of a record key in bytes.
    pub max_key_len: usize,
}

impl EngineConfig {
    /// Creates a configuration for the given namespace and user.
    pub fn new(namespace: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            user_id: user_id.into(),
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
            capacity_retry_delay: Duration::from_millis(250),
            max_cache_entries: 100,
            batch_concurrency: 3,
            batch_size: 10,
            sync_fan_out: 1,
            max_key_len: 256,
        }
    }

    /// Sets the retry cap.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the first backoff delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the backoff cap.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the delay used after local storage failures.
    pub fn with_capacity_retry_delay(mut self, delay: Duration) -> Self {
        self.capacity_retry_delay = delay;
        self
    }

    /// Sets the resource cache capacity.
    pub fn with_max_cache_entries(mut self, entries: usize) -> Self {
        self.max_cache_entries = entries;
        self
    }

    /// Sets the batch worker pool size.
    pub fn with_batch_concurrency(mut self, concurrency: usize) -> Self {
        self.batch_concurrency = concurrency;
        self
    }

    /// Sets how many jobs are pulled per scheduling tick.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets how many distinct keys may be delivered at once.
    pub fn with_sync_fan_out(mut self, fan_out: usize) -> Self {
        self.sync_fan_out = fan_out;
        self
    }

    /// Checks the configuration for values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] describing the first bad value.
    pub fn validate(&self) -> SyncResult<()> {
        if self.namespace.is_empty() || self.namespace.contains('/') {
            return Err(SyncError::validation(
                "namespace must be non-empty and contain no '/'",
            ));
        }
        if self.user_id.is_empty() || self.user_id.contains('/') {
            return Err(SyncError::validation(
                "user_id must be non-empty and contain no '/'",
            ));
        }
        if self.base_delay > self.max_delay {
            return Err(SyncError::validation("base_delay exceeds max_delay"));
        }
        if self.capacity_retry_delay.is_zero() {
            return Err(SyncError::validation("capacity_retry_delay must be non-zero"));
        }
        if self.max_cache_entries == 0 {
            return Err(SyncError::validation("max_cache_entries must be at least 1"));
        }
        if self.batch_concurrency == 0 || self.batch_size == 0 {
            return Err(SyncError::validation(
                "batch_concurrency and batch_size must be at least 1",
            ));
        }
        if self.sync_fan_out == 0 {
            return Err(SyncError::validation("sync_fan_out must be at least 1"));
        }
        if self.max_key_len == 0 {
            return Err(SyncError::validation("max_key_len must be at least 1"));
        }
        Ok(())
    }

    /// Prefix under which every record of this namespace/user is persisted.
    pub fn storage_prefix(&self) -> String {
        format!("{}/{}/", self.namespace, self.user_id)
    }

    /// Backoff delay after the given failed attempt (1-indexed).
    ///
    /// `base_delay * 2^(attempt-1)`, capped at `max_delay`. Attempt 0 has
    /// no delay.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new("resync", "local")
    }
}
