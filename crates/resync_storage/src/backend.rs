//! Persistence trait definition.

use crate::error::StorageResult;

/// A key-value persistence layer for resync records.
///
/// Implementations store **opaque bytes** under string keys. The record
/// store above decides the key layout and the blob format.
///
/// # Invariants
///
/// - `get` after a successful `set` returns exactly the bytes written
/// - `delete` of a missing key succeeds
/// - `keys` returns every live key starting with the prefix, in ascending order
/// - Implementations must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::InMemoryPersistence`] - For testing
/// - [`super::FilePersistence`] - For persistent storage
pub trait Persistence: Send + Sync {
    /// Reads the blob stored under `key`, or `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying medium cannot be read.
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Stores `value` under `key`, replacing any previous blob.
    ///
    /// After this returns successfully the value must survive a process
    /// restart (for durable backends).
    ///
    /// # Errors
    ///
    /// Returns an error if the write cannot be made durable.
    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()>;

    /// Removes `key`. Removing a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the removal fails.
    fn delete(&self, key: &str) -> StorageResult<()>;

    /// Lists all keys that start with `prefix`, sorted ascending.
    ///
    /// # Errors
    ///
    /// Returns an error if the key space cannot be enumerated.
    fn keys(&self, prefix: &str) -> StorageResult<Vec<String>>;
}
