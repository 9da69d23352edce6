//! LRU bookkeeping for leaves whose events are held in memory.
//!
//! The cache never touches the boxes themselves: it only tracks how many bytes
//! of events each leaf currently holds and in which order leaves were last
//! used. When the total exceeds the budget it names the least recently used,
//! unpinned leaves; the tree then evicts those leaves through the file backend.

use std::collections::HashSet;

use lru::LruCache;

use super::file_backend::BoxId;

/// In-memory event budget tracker.
pub struct LeafCache {
    /// Leaf id -> bytes of in-memory events (front = most recently used)
    entries: LruCache<BoxId, u64>,
    /// Leaves that must not be evicted right now
    pinned: HashSet<BoxId>,
    used_bytes: u64,
    capacity_bytes: u64,
}

impl LeafCache {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            entries: LruCache::unbounded(),
            pinned: HashSet::new(),
            used_bytes: 0,
            capacity_bytes,
        }
    }

    /// Records `bytes` more in-memory data for a leaf and marks it most recently used.
    pub fn add_bytes(&mut self, leaf_id: BoxId, bytes: u64) {
        let current = self.entries.pop(&leaf_id).unwrap_or(0);
        self.entries.put(leaf_id, current + bytes);
        self.used_bytes += bytes;
    }

    /// Marks a leaf most recently used without changing its size.
    pub fn touch(&mut self, leaf_id: BoxId) {
        let _ = self.entries.get(&leaf_id);
    }

    /// Forgets a leaf (evicted or converted to an interior box).
    pub fn remove(&mut self, leaf_id: BoxId) -> Option<u64> {
        self.pinned.remove(&leaf_id);
        let bytes = self.entries.pop(&leaf_id)?;
        self.used_bytes -= bytes;
        Some(bytes)
    }

    pub fn pin(&mut self, leaf_id: BoxId) {
        self.pinned.insert(leaf_id);
    }

    pub fn unpin(&mut self, leaf_id: BoxId) {
        self.pinned.remove(&leaf_id);
    }

    pub fn needs_eviction(&self) -> bool {
        self.used_bytes > self.capacity_bytes
    }

    /// Least recently used unpinned leaves whose removal brings usage back
    /// within capacity (or as close as pinning allows).
    pub fn select_victims(&self) -> Vec<BoxId> {
        let mut excess = self.used_bytes.saturating_sub(self.capacity_bytes);
        let mut victims = Vec::new();
        for (&leaf_id, &bytes) in self.entries.iter().rev() {
            if excess == 0 {
                break;
            }
            if self.pinned.contains(&leaf_id) {
                continue;
            }
            victims.push(leaf_id);
            excess = excess.saturating_sub(bytes);
        }
        victims
    }

    /// Every unpinned leaf currently holding events, most recently used first.
    pub fn all_unpinned(&self) -> Vec<BoxId> {
        self.entries
            .iter()
            .map(|(&leaf_id, _)| leaf_id)
            .filter(|leaf_id| !self.pinned.contains(leaf_id))
            .collect()
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for LeafCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafCache")
            .field("leaves", &self.entries.len())
            .field("pinned", &self.pinned.len())
            .field("used_bytes", &self.used_bytes)
            .field("capacity_bytes", &self.capacity_bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_cache_new() {
        let cache = LeafCache::new(100);
        assert!(cache.is_empty());
        assert_eq!(cache.used_bytes(), 0);
        assert!(!cache.needs_eviction());
    }

    #[test]
    fn test_add_bytes_accumulates() {
        let mut cache = LeafCache::new(100);
        cache.add_bytes(1, 30);
        cache.add_bytes(1, 20);
        cache.add_bytes(2, 10);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.used_bytes(), 60);
        assert_eq!(cache.remove(1), Some(50));
        assert_eq!(cache.used_bytes(), 10);
    }

    #[test]
    fn test_victims_in_lru_order() {
        let mut cache = LeafCache::new(50);
        cache.add_bytes(1, 30);
        cache.add_bytes(2, 30);
        cache.add_bytes(3, 30);
        assert!(cache.needs_eviction());

        // Leaf 1 becomes most recently used.
        cache.touch(1);
        assert_eq!(cache.select_victims(), vec![2, 3]);
    }

    #[test]
    fn test_pinned_leaves_are_skipped() {
        let mut cache = LeafCache::new(50);
        cache.add_bytes(1, 30);
        cache.add_bytes(2, 30);
        cache.add_bytes(3, 30);
        cache.pin(1);
        assert_eq!(cache.select_victims(), vec![2, 3]);

        cache.unpin(1);
        assert_eq!(cache.select_victims(), vec![1, 2]);
    }

    #[test]
    fn test_no_victims_within_capacity() {
        let mut cache = LeafCache::new(100);
        cache.add_bytes(1, 40);
        assert!(cache.select_victims().is_empty());
    }

    #[test]
    fn test_all_unpinned() {
        let mut cache = LeafCache::new(0);
        cache.add_bytes(1, 1);
        cache.add_bytes(2, 1);
        cache.pin(2);
        assert_eq!(cache.all_unpinned(), vec![1]);
    }

    #[test]
    fn test_remove_unknown_leaf() {
        let mut cache = LeafCache::new(10);
        assert_eq!(cache.remove(42), None);
        assert!(cache.is_empty());
    }
}
