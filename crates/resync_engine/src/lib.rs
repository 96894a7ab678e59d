//! # resync engine
//!
//! Offline-first record synchronisation for client applications.
//!
//! This crate provides:
//! - A durable record store with per-key sync state (Dirty → Syncing → Synced / Failed)
//! - A per-key ordered sync queue with exponential backoff
//! - A bounded LRU cache for remotely fetched resources
//! - A priority dispatcher for expensive remote jobs under a concurrency cap
//! - The [`Reconciler`] tying them together behind local-first reads and writes
//!
//! ## Architecture
//!
//! Every external effect is an injected capability: [`Transport`] delivers
//! records, [`RemoteOperation`] runs batch jobs, `resync_storage::Persistence`
//! stores bytes, [`Clock`] schedules backoff and [`ErrorSink`] receives
//! terminal failures. Engines are plain values with an explicit
//! start/shutdown lifecycle, so several can run side by side.
//!
//! ## Key Invariants
//!
//! - A write is readable locally before it is delivered
//! - At most one delivery per key is in flight; writes to a key reach the remote in order
//! - A stale delivery never marks a newer local write as synced
//! - A record becomes Failed after `max_retries + 1` failed attempts or one permanent rejection,
//!   and is reported exactly once
//! - A batch job resolves exactly once

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod clock;
mod config;
mod dispatcher;
mod error;
mod queue;
mod reconciler;
mod record;
mod sink;
mod store;
mod transport;

pub use cache::{BoundedCache, CacheEntry, CacheStats};
pub use clock::{Clock, Millis, TokioClock};
pub use config::EngineConfig;
pub use dispatcher::{BatchDispatcher, DispatcherStats, JobError, JobHandle, JobId, RemoteOperation};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use queue::{DrainReport, QueueItem, SyncQueue};
pub use reconciler::{Reconciler, SyncStats};
pub use record::{Record, SyncState, RECORD_FORMAT};
pub use sink::{ErrorSink, FailureKind, FailureReport, MemoryErrorSink, TracingErrorSink};
pub use store::RecordStore;
pub use transport::{MockTransport, SentCall, Transport};
