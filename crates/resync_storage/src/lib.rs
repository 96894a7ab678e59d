//! # resync storage
//!
//! The persistence capability underneath the resync record store.
//!
//! Backends are **opaque key-value byte stores**. They never interpret
//! the blobs they hold; the engine owns the record format.
//!
//! ## Design Principles
//!
//! - Every operation is synchronous (no suspension points)
//! - `delete` is idempotent
//! - Backends must be `Send + Sync` so one store can be shared across tasks
//!
//! ## Available Backends
//!
//! - [`InMemoryPersistence`] - For testing and ephemeral sessions
//! - [`FilePersistence`] - Directory-backed, survives process restarts
//!
//! ## Example
//!
//! ```rust
//! use resync_storage::{InMemoryPersistence, Persistence};
//!
//! let store = InMemoryPersistence::new();
//! store.set("app/user-1/progress", b"{\"score\":80}").unwrap();
//! assert_eq!(store.get("app/user-1/progress").unwrap().unwrap(), b"{\"score\":80}");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::Persistence;
pub use error::{StorageError, StorageResult};
pub use file::FilePersistence;
pub use memory::InMemoryPersistence;
