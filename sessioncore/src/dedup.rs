use indexmap::IndexSet;

pub const DEFAULT_DEDUP_CAPACITY: usize = 5_000;
pub const DEFAULT_EVICTION_BATCH: usize = 500;

/// Bounded, insertion-ordered set of processed message ids.
///
/// Once the set grows past `capacity`, the oldest `eviction_batch` ids are
/// dropped together.
#[derive(Debug, Clone)]
pub struct DedupCache {
    seen: IndexSet<String>,
    capacity: usize,
    eviction_batch: usize,
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY, DEFAULT_EVICTION_BATCH)
    }
}

impl DedupCache {
    pub fn new(capacity: usize, eviction_batch: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            seen: IndexSet::with_capacity(capacity + 1),
            capacity,
            eviction_batch: eviction_batch.clamp(1, capacity),
        }
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.seen.contains(message_id)
    }

    /// Records `message_id`. Returns false if it was already present.
    pub fn insert(&mut self, message_id: impl Into<String>) -> bool {
        let inserted = self.seen.insert(message_id.into());
        if inserted && self.seen.len() > self.capacity {
            self.evict_oldest();
        }
        inserted
    }

    fn evict_oldest(&mut self) {
        let overflow = self.seen.len() - self.capacity;
        let count = self.eviction_batch.max(overflow).min(self.seen.len());
        self.seen.drain(..count);
        log::debug!(target: "Session/Dedup", "Evicted {count} oldest message ids");
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }
}
