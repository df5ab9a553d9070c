use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Bounded chunk cache with least-recently-used eviction.
///
/// Hits only take the read lock; recency is stamped through an atomic
/// clock so concurrent readers do not serialise on lookups. Eviction
/// ties (never-touched entries racing on the same stamp) fall back to
/// insertion order.
#[derive(Debug)]
pub struct ChunkCache {
    capacity: usize,
    clock: AtomicU64,
    insertions: AtomicU64,
    map: RwLock<HashMap<u64, CacheSlot>>,
}

#[derive(Debug)]
struct CacheSlot {
    data: Arc<Vec<u8>>,
    stamp: AtomicU64,
    inserted: u64,
}

impl ChunkCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            clock: AtomicU64::new(0),
            insertions: AtomicU64::new(0),
            map: RwLock::new(HashMap::with_capacity(capacity.min(4096))),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Look up a decoded chunk, refreshing its recency.
    #[must_use]
    pub fn get(&self, chunk: u64) -> Option<Arc<Vec<u8>>> {
        let map = self.map.read();
        let slot = map.get(&chunk)?;
        slot.stamp
            .store(self.clock.fetch_add(1, Ordering::Relaxed) + 1, Ordering::Relaxed);
        Some(Arc::clone(&slot.data))
    }

    /// Insert a decoded chunk, evicting the least-recently-used entry
    /// when full. A zero capacity disables caching entirely.
    pub fn insert(&self, chunk: u64, data: Arc<Vec<u8>>) {
        if self.capacity == 0 {
            return;
        }
        let mut map = self.map.write();
        if map.contains_key(&chunk) {
            return;
        }
        if map.len() >= self.capacity {
            let victim = map
                .iter()
                .min_by_key(|(_, slot)| (slot.stamp.load(Ordering::Relaxed), slot.inserted))
                .map(|(k, _)| *k);
            if let Some(victim) = victim {
                trace!(target: "wfs::ewf", event = "cache_evict", chunk = victim);
                map.remove(&victim);
            }
        }
        map.insert(
            chunk,
            CacheSlot {
                data,
                stamp: AtomicU64::new(self.clock.fetch_add(1, Ordering::Relaxed) + 1),
                inserted: self.insertions.fetch_add(1, Ordering::Relaxed),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(byte: u8) -> Arc<Vec<u8>> {
        Arc::new(vec![byte; 8])
    }

    #[test]
    fn hit_and_miss() {
        let cache = ChunkCache::new(4);
        assert!(cache.get(0).is_none());
        cache.insert(0, chunk(0xAA));
        assert_eq!(cache.get(0).expect("hit")[0], 0xAA);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = ChunkCache::new(2);
        cache.insert(1, chunk(1));
        cache.insert(2, chunk(2));
        // Touch 1 so 2 becomes the eviction candidate.
        let _ = cache.get(1);
        cache.insert(3, chunk(3));

        assert!(cache.get(1).is_some());
        assert!(cache.get(2).is_none());
        assert!(cache.get(3).is_some());
    }

    #[test]
    fn eviction_ties_break_by_insertion_order() {
        let cache = ChunkCache::new(2);
        cache.insert(1, chunk(1));
        cache.insert(2, chunk(2));
        // Neither entry touched since insert: the older insertion goes.
        cache.insert(3, chunk(3));
        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_some());
    }

    #[test]
    fn zero_capacity_disables_caching() {
        let cache = ChunkCache::new(0);
        cache.insert(1, chunk(1));
        assert!(cache.get(1).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn reinsert_keeps_first_data() {
        let cache = ChunkCache::new(2);
        cache.insert(1, chunk(0x11));
        cache.insert(1, chunk(0x22));
        assert_eq!(cache.get(1).expect("hit")[0], 0x11);
    }
}
