//! In-memory persistence for testing.

use crate::backend::Persistence;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// An in-memory persistence backend.
///
/// This backend keeps all blobs in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral sessions that don't need to survive a restart
///
/// Writes can be made to fail on demand with [`set_read_only`], which
/// lets tests exercise the engine's storage-failure path.
///
/// # Example
///
/// ```rust
/// use resync_storage::{InMemoryPersistence, Persistence};
///
/// let store = InMemoryPersistence::new();
/// store.set("k", b"v").unwrap();
/// assert_eq!(store.len(), 1);
/// ```
///
/// [`set_read_only`]: InMemoryPersistence::set_read_only
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
    read_only: AtomicBool,
}

impl InMemoryPersistence {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend pre-populated with entries.
    ///
    /// Useful for testing recovery scenarios.
    #[must_use]
    pub fn with_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, Vec<u8>)>,
    {
        Self {
            data: RwLock::new(entries.into_iter().collect()),
            read_only: AtomicBool::new(false),
        }
    }

    /// Makes every subsequent `set`/`delete` fail with [`StorageError::Full`].
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Returns a copy of all entries.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.data.read().clone()
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(StorageError::Full("in-memory backend is read-only".into()));
        }
        Ok(())
    }
}

impl Persistence for InMemoryPersistence {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        self.check_writable()?;
        self.data.write().insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        self.check_writable()?;
        self.data.write().remove(key);
        Ok(())
    }

    fn keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .data
            .read()
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_new_is_empty() {
        let store = InMemoryPersistence::new();
        assert!(store.is_empty());
        assert_eq!(store.get("missing").unwrap(), None);
    }

    #[test]
    fn memory_set_then_get() {
        let store = InMemoryPersistence::new();
        store.set("a", b"hello").unwrap();
        assert_eq!(store.get("a").unwrap().unwrap(), b"hello");

        store.set("a", b"world").unwrap();
        assert_eq!(store.get("a").unwrap().unwrap(), b"world");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn memory_delete_is_idempotent() {
        let store = InMemoryPersistence::new();
        store.set("a", b"x").unwrap();
        store.delete("a").unwrap();
        store.delete("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
    }

    #[test]
    fn memory_keys_by_prefix() {
        let store = InMemoryPersistence::new();
        store.set("ns/u1/b", b"1").unwrap();
        store.set("ns/u1/a", b"2").unwrap();
        store.set("ns/u2/a", b"3").unwrap();
        store.set("other", b"4").unwrap();

        assert_eq!(store.keys("ns/u1/").unwrap(), vec!["ns/u1/a", "ns/u1/b"]);
        assert_eq!(store.keys("").unwrap().len(), 4);
        assert!(store.keys("zzz").unwrap().is_empty());
    }

    #[test]
    fn memory_read_only_rejects_writes() {
        let store = InMemoryPersistence::new();
        store.set("a", b"x").unwrap();
        store.set_read_only(true);

        assert!(matches!(store.set("b", b"y"), Err(StorageError::Full(_))));
        assert!(matches!(store.delete("a"), Err(StorageError::Full(_))));
        assert_eq!(store.get("a").unwrap().unwrap(), b"x");

        store.set_read_only(false);
        store.set("b", b"y").unwrap();
    }

    #[test]
    fn memory_with_entries() {
        let store = InMemoryPersistence::with_entries(vec![("k".to_string(), b"v".to_vec())]);
        assert_eq!(store.snapshot().len(), 1);
        assert_eq!(store.get("k").unwrap().unwrap(), b"v");
    }
}
