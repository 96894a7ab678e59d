//! # resync testkit
//!
//! Test utilities for resync.
//!
//! This crate provides:
//! - Engine fixtures wired to mock capabilities on a paused tokio clock
//! - Property-based test generators using proptest
//! - A scripted [`RemoteOperation`](resync_engine::RemoteOperation) that
//!   records execution order and concurrency
//!
//! ## Usage
//!
//! ```rust,ignore
//! use resync_testkit::prelude::*;
//!
//! #[tokio::test(start_paused = true)]
//! async fn syncs() {
//!     let harness = TestHarness::new();
//!     harness.engine.write("progress_1", progress_payload(80)).unwrap();
//!     harness.engine.sync_until_idle().await;
//!     assert_eq!(harness.state("progress_1"), Some(SyncState::Synced));
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod operations;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::operations::*;
    pub use resync_engine::{
        BatchDispatcher, EngineConfig, FailureKind, JobError, SyncError, SyncState,
    };
}

pub use fixtures::*;
pub use generators::*;
pub use operations::*;
