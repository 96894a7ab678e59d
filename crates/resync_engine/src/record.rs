//! The durable, synchronised unit of application state.

use crate::clock::Millis;
use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};

/// Current on-disk format of an encoded record.
pub const RECORD_FORMAT: u8 = 1;

/// Synchronisation status of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncState {
    /// Written locally, waiting for delivery.
    Dirty,
    /// A delivery is in flight.
    Syncing,
    /// The remote holds this version.
    Synced,
    /// Delivery gave up. Only a new local write or a manual retry re-arms it.
    Failed,
}

impl SyncState {
    /// Returns true if the record still needs to reach the remote.
    pub fn is_pending(&self) -> bool {
        matches!(self, SyncState::Dirty | SyncState::Syncing)
    }

    /// Short lowercase name, used by logs and the CLI.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Dirty => "dirty",
            SyncState::Syncing => "syncing",
            SyncState::Synced => "synced",
            SyncState::Failed => "failed",
        }
    }
}

/// A keyed payload together with its sync bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Application key (without namespace prefix).
    pub key: String,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
    /// Strictly increasing per key; stamped from the clock on every write.
    pub version: u64,
    /// Where the record is in its sync lifecycle.
    pub sync_state: SyncState,
    /// Failed delivery attempts since the last success, manual retry, or write
    /// over a Synced or Failed record.
    pub attempt: u32,
    /// Message of the most recent delivery failure.
    pub last_error: Option<String>,
    /// Time of the last mutation of this record.
    pub last_updated: Millis,
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    format: u8,
    record: T,
}

impl Record {
    /// Encodes the record as a versioned CBOR blob.
    pub fn encode(&self) -> SyncResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(
            &Envelope {
                format: RECORD_FORMAT,
                record: self,
            },
            &mut buf,
        )?;
        Ok(buf)
    }

    /// Decodes a blob produced by [`Record::encode`].
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Codec`] for malformed bytes or an unknown format.
    pub fn decode(bytes: &[u8]) -> SyncResult<Self> {
        let envelope: Envelope<Record> = ciborium::from_reader(bytes)?;
        if envelope.format != RECORD_FORMAT {
            return Err(SyncError::Codec(format!(
                "unsupported record format {}",
                envelope.format
            )));
        }
        Ok(envelope.record)
    }
}
