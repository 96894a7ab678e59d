//! Durable record store.
//!
//! Maps application keys to [`Record`]s on top of a [`Persistence`]
//! backend. Every method is synchronous with respect to the backend, and
//! read-modify-write sequences run under one mutation lock so a version
//! check and the write that depends on it cannot interleave.

use crate::clock::{Clock, Millis};
use crate::config::EngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::record::{Record, SyncState};
use parking_lot::Mutex;
use resync_storage::Persistence;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Key-to-record persistence with sync-state transitions.
pub struct RecordStore {
    persistence: Arc<dyn Persistence>,
    clock: Arc<dyn Clock>,
    prefix: String,
    max_key_len: usize,
    mutation: Mutex<()>,
    last_updated: AtomicU64,
}

impl RecordStore {
    /// Creates a store persisting under `config.storage_prefix()`.
    pub fn new(
        config: &EngineConfig,
        persistence: Arc<dyn Persistence>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            persistence,
            clock,
            prefix: config.storage_prefix(),
            max_key_len: config.max_key_len,
            mutation: Mutex::new(()),
            last_updated: AtomicU64::new(0),
        }
    }

    /// Checks that `key` can be used as a record key.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] for empty, oversized or
    /// control-character keys.
    pub fn validate_key(&self, key: &str) -> SyncResult<()> {
        if key.is_empty() {
            return Err(SyncError::validation("record key must not be empty"));
        }
        if key.len() > self.max_key_len {
            return Err(SyncError::validation(format!(
                "record key is {} bytes, limit is {}",
                key.len(),
                self.max_key_len
            )));
        }
        if key.chars().any(char::is_control) {
            return Err(SyncError::validation(
                "record key must not contain control characters",
            ));
        }
        Ok(())
    }

    /// Creates or overwrites the record for `key` and marks it Dirty.
    ///
    /// The new version is `max(now, previous + 1)`, so versions stay strictly
    /// increasing even within one clock tick. A write over a pending record
    /// (Dirty or Syncing) keeps its attempt counter and last error, so
    /// rewriting between failures neither restarts the backoff nor extends
    /// the retry budget. A write over a Synced or Failed record starts with
    /// a fresh budget.
    pub fn put(&self, key: &str, payload: Vec<u8>) -> SyncResult<Record> {
        self.validate_key(key)?;
        let _guard = self.mutation.lock();

        let now = self.clock.now();
        let (version, attempt, last_error) = match self.load(key)? {
            Some(previous) if previous.sync_state.is_pending() => (
                now.max(previous.version + 1),
                previous.attempt,
                previous.last_error,
            ),
            Some(previous) => (now.max(previous.version + 1), 0, None),
            None => (now, 0, None),
        };
        let record = Record {
            key: key.to_owned(),
            payload,
            version,
            sync_state: SyncState::Dirty,
            attempt,
            last_error,
            last_updated: now,
        };
        self.save(&record)?;
        debug!(key = %key, version, "record written");
        Ok(record)
    }

    /// Returns the record for `key`, if any.
    pub fn get(&self, key: &str) -> SyncResult<Option<Record>> {
        self.load(key)
    }

    /// Marks `version` of `key` as in flight.
    ///
    /// Returns false (and changes nothing) if the stored version differs.
    pub fn mark_syncing(&self, key: &str, version: u64) -> SyncResult<bool> {
        self.transition(key, version, |record| {
            record.sync_state = SyncState::Syncing;
        })
    }

    /// Marks `version` of `key` as Synced and resets its attempt counter.
    ///
    /// A no-op returning false if a newer local write superseded `version`,
    /// so stale data is never marked as synced.
    pub fn mark_synced(&self, key: &str, version: u64) -> SyncResult<bool> {
        self.transition(key, version, |record| {
            record.sync_state = SyncState::Synced;
            record.attempt = 0;
            record.last_error = None;
        })
    }

    /// Counts one failed delivery of `version`; the record returns to Dirty.
    ///
    /// Returns the new attempt count, or `None` if the version was superseded.
    pub fn record_failure(&self, key: &str, version: u64, error: &str) -> SyncResult<Option<u32>> {
        let _guard = self.mutation.lock();
        let Some(mut record) = self.load(key)? else {
            return Ok(None);
        };
        if record.version != version {
            return Ok(None);
        }
        record.attempt += 1;
        record.sync_state = SyncState::Dirty;
        record.last_error = Some(error.to_owned());
        record.last_updated = self.clock.now();
        self.save(&record)?;
        Ok(Some(record.attempt))
    }

    /// Moves `version` of `key` to the terminal Failed state.
    ///
    /// `attempt` is left as counted by [`record_failure`]. Returns false if
    /// superseded.
    ///
    /// [`record_failure`]: RecordStore::record_failure
    pub fn mark_failed(&self, key: &str, version: u64, error: &str) -> SyncResult<bool> {
        self.transition(key, version, |record| {
            record.sync_state = SyncState::Failed;
            record.last_error = Some(error.to_owned());
        })
    }

    /// Returns a record to Dirty after it failed or was interrupted
    /// mid-delivery, resetting its attempt counter.
    ///
    /// Returns the updated record, or `None` if absent or already Dirty/Synced.
    pub fn reset(&self, key: &str) -> SyncResult<Option<Record>> {
        let _guard = self.mutation.lock();
        let Some(mut record) = self.load(key)? else {
            return Ok(None);
        };
        if !matches!(record.sync_state, SyncState::Failed | SyncState::Syncing) {
            return Ok(None);
        }
        if record.sync_state == SyncState::Failed {
            record.attempt = 0;
            record.last_error = None;
        }
        record.sync_state = SyncState::Dirty;
        record.last_updated = self.clock.now();
        self.save(&record)?;
        Ok(Some(record))
    }

    /// Removes the record for `key`. Returns true if one existed.
    pub fn delete(&self, key: &str) -> SyncResult<bool> {
        let _guard = self.mutation.lock();
        let existed = self.persistence.get(&self.storage_key(key))?.is_some();
        self.persistence.delete(&self.storage_key(key))?;
        self.touch();
        Ok(existed)
    }

    /// All records of this namespace and user, ordered by key.
    pub fn list(&self) -> SyncResult<Vec<Record>> {
        let mut records = Vec::new();
        for storage_key in self.persistence.keys(&self.prefix)? {
            if let Some(bytes) = self.persistence.get(&storage_key)? {
                records.push(Record::decode(&bytes)?);
            }
        }
        Ok(records)
    }

    /// Deletes every record of this namespace and user (account reset).
    ///
    /// Returns the number of records removed.
    pub fn clear_all(&self) -> SyncResult<usize> {
        let _guard = self.mutation.lock();
        let keys = self.persistence.keys(&self.prefix)?;
        for storage_key in &keys {
            self.persistence.delete(storage_key)?;
        }
        self.touch();
        Ok(keys.len())
    }

    /// Time of the last mutation through this store, if any.
    pub fn last_updated(&self) -> Option<Millis> {
        match self.last_updated.load(Ordering::SeqCst) {
            0 => None,
            at => Some(at),
        }
    }

    fn transition(
        &self,
        key: &str,
        version: u64,
        apply: impl FnOnce(&mut Record),
    ) -> SyncResult<bool> {
        let _guard = self.mutation.lock();
        let Some(mut record) = self.load(key)? else {
            return Ok(false);
        };
        if record.version != version {
            return Ok(false);
        }
        apply(&mut record);
        record.last_updated = self.clock.now();
        self.save(&record)?;
        Ok(true)
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn load(&self, key: &str) -> SyncResult<Option<Record>> {
        self.persistence
            .get(&self.storage_key(key))?
            .map(|bytes| Record::decode(&bytes))
            .transpose()
    }

    fn save(&self, record: &Record) -> SyncResult<()> {
        self.persistence
            .set(&self.storage_key(&record.key), &record.encode()?)?;
        self.touch();
        Ok(())
    }

    fn touch(&self) {
        self.last_updated.store(self.clock.now().max(1), Ordering::SeqCst);
    }
}
