//! Fixed-capacity LRU cache for remotely fetched resources.
//!
//! Recency is tracked with a logical access counter rather than wall-clock
//! time: every hit or insert takes the next tick, so two accesses never tie
//! and the oldest insertion naturally loses when nothing else separates
//! entries.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

/// A cached value with its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// Cached value.
    pub value: V,
    /// Share of the capacity this entry occupies.
    pub size_cost: usize,
    /// Logical time of the last access (insert or hit).
    pub last_accessed_at: u64,
}

/// Counters describing cache effectiveness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that found an entry.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Entries removed to make room.
    pub evictions: u64,
    /// Successful inserts (including replacements).
    pub insertions: u64,
}

struct CacheInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    recency: BTreeMap<u64, String>,
    tick: u64,
    total_cost: usize,
    stats: CacheStats,
}

impl<V> CacheInner<V> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.last_accessed_at);
        self.total_cost -= entry.size_cost;
        Some(entry)
    }
}

/// A thread-safe, cost-bounded LRU cache.
///
/// The sum of `size_cost` over all entries never exceeds `capacity`.
/// Inserting past capacity evicts least-recently-accessed entries first;
/// it never fails. Concurrent writers to the same key race and the last
/// one wins.
pub struct BoundedCache<V> {
    capacity: usize,
    inner: Mutex<CacheInner<V>>,
}

impl<V: Clone> BoundedCache<V> {
    /// Creates an empty cache holding at most `capacity` cost units.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                tick: 0,
                total_cost: 0,
                stats: CacheStats::default(),
            }),
        }
    }

    /// Looks up `key`, promoting it to most recently used on a hit.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock();
        let tick = inner.next_tick();
        let inner = &mut *inner;
        match inner.entries.get_mut(key) {
            Some(entry) => {
                inner.recency.remove(&entry.last_accessed_at);
                entry.last_accessed_at = tick;
                inner.recency.insert(tick, key.to_owned());
                inner.stats.hits += 1;
                Some(entry.value.clone())
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    /// Inserts `value` with a cost of one unit.
    pub fn put(&self, key: &str, value: V) {
        self.put_with_cost(key, value, 1);
    }

    /// Inserts `value` occupying `size_cost` units (minimum one).
    ///
    /// Evicts least-recently-accessed entries until the new entry fits. An
    /// entry larger than the whole capacity is not stored.
    pub fn put_with_cost(&self, key: &str, value: V, size_cost: usize) {
        let size_cost = size_cost.max(1);
        let mut inner = self.inner.lock();
        inner.remove(key);

        if size_cost > self.capacity {
            warn!(
                key = %key,
                size_cost,
                capacity = self.capacity,
                "resource larger than cache capacity, not cached"
            );
            return;
        }

        while inner.total_cost + size_cost > self.capacity {
            let Some((_, victim)) = inner.recency.pop_first() else {
                break;
            };
            if let Some(entry) = inner.entries.remove(&victim) {
                inner.total_cost -= entry.size_cost;
                inner.stats.evictions += 1;
            }
        }

        let tick = inner.next_tick();
        inner.recency.insert(tick, key.to_owned());
        inner.entries.insert(
            key.to_owned(),
            CacheEntry {
                value,
                size_cost,
                last_accessed_at: tick,
            },
        );
        inner.total_cost += size_cost;
        inner.stats.insertions += 1;
    }

    /// Removes `key`. Returns true if it was cached.
    pub fn invalidate(&self, key: &str) -> bool {
        self.inner.lock().remove(key).is_some()
    }

    /// Removes every entry. Statistics are kept.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.recency.clear();
        inner.total_cost = 0;
    }

    /// Returns true if `key` is cached, without promoting it.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Copy of the entry for `key` with its bookkeeping, without promoting it.
    pub fn peek(&self, key: &str) -> Option<CacheEntry<V>> {
        self.inner.lock().entries.get(key).cloned()
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Sum of the costs of all cached entries.
    pub fn total_cost(&self) -> usize {
        self.inner.lock().total_cost
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Keys from least to most recently accessed.
    pub fn keys_by_recency(&self) -> Vec<String> {
        self.inner.lock().recency.values().cloned().collect()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn hit_and_miss() {
        let cache = BoundedCache::new(2);
        assert_eq!(cache.get("a"), None);
        cache.put("a", 1);
        assert_eq!(cache.get("a"), Some(1));

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.insertions), (1, 1, 1));
    }

    #[test]
    fn evicts_least_recently_accessed() {
        let cache = BoundedCache::new(3);
        cache.put("a", 1);
        cache.put("b", 2);
        cache.put("c", 3);

        // touch "a" so "b" becomes the oldest
        assert_eq!(cache.get("a"), Some(1));
        cache.put("d", 4);

        assert_eq!(cache.len(), 3);
        assert!(!cache.contains("b"));
        assert_eq!(cache.keys_by_recency(), vec!["c", "a", "d"]);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn peek_does_not_promote() {
        let cache = BoundedCache::new(2);
        cache.put("a", 1);
        cache.put("b", 2);

        let entry = cache.peek("a").unwrap();
        assert_eq!((entry.value, entry.size_cost), (1, 1));
        cache.put("c", 3);
        assert!(!cache.contains("a"));
    }

    #[test]
    fn insertion_order_breaks_ties() {
        let cache = BoundedCache::new(2);
        cache.put("first", 1);
        cache.put("second", 2);
        cache.put("third", 3);
        assert!(!cache.contains("first"));
        assert!(cache.contains("second"));
    }

    #[test]
    fn replacing_refreshes_value_and_recency() {
        let cache = BoundedCache::new(2);
        cache.put("a", 1);
        cache.put("b", 2);
        cache.put("a", 10);
        cache.put("c", 3);

        assert_eq!(cache.get("a"), Some(10));
        assert!(!cache.contains("b"));
    }

    #[test]
    fn costs_bound_total() {
        let cache = BoundedCache::new(10);
        cache.put_with_cost("audio-1", "x", 4);
        cache.put_with_cost("audio-2", "y", 4);
        cache.put_with_cost("audio-3", "z", 4);

        assert_eq!(cache.total_cost(), 8);
        assert!(!cache.contains("audio-1"));

        cache.put_with_cost("huge", "w", 11);
        assert!(!cache.contains("huge"));
        assert_eq!(cache.total_cost(), 8);
    }

    #[test]
    fn invalidate_and_clear() {
        let cache = BoundedCache::new(4);
        cache.put("a", 1);
        cache.put("b", 2);

        assert!(cache.invalidate("a"));
        assert!(!cache.invalidate("a"));
        assert_eq!(cache.total_cost(), 1);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.total_cost(), 0);
        cache.put("c", 3);
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn concurrent_writers_last_one_wins() {
        let cache = Arc::new(BoundedCache::new(8));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        cache.put(&format!("k{}", i % 16), t);
                        cache.get(&format!("k{}", (i + 3) % 16));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(cache.len() <= 8);
        assert_eq!(cache.total_cost(), cache.len());
    }

    proptest! {
        #[test]
        fn keeps_exactly_the_most_recent(capacity in 1usize..16, extra in 1usize..16) {
            let cache = BoundedCache::new(capacity);
            let total = capacity + extra;
            for i in 0..total {
                cache.put(&format!("k{i}"), i);
            }
            prop_assert_eq!(cache.len(), capacity);
            for i in 0..total {
                prop_assert_eq!(cache.contains(&format!("k{i}")), i >= extra);
            }
        }

        #[test]
        fn never_exceeds_capacity(
            capacity in 1usize..20,
            ops in proptest::collection::vec((0u8..30, 1usize..6, any::<bool>()), 1..200),
        ) {
            let cache = BoundedCache::new(capacity);
            for (key, cost, read) in ops {
                let key = format!("k{key}");
                if read {
                    cache.get(&key);
                } else {
                    cache.put_with_cost(&key, key.clone(), cost);
                }
                prop_assert!(cache.total_cost() <= capacity);
            }
        }
    }
}
