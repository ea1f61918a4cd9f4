use doc_model::PageTextContent;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Arc;

/// Default number of pages whose text is kept in memory.
pub const DEFAULT_TEXT_CACHE_PAGES: usize = 50;

/// Capacity-bounded map that evicts the earliest-inserted entry on overflow.
///
/// Reads do not refresh an entry's position; eviction order is insertion order only.
#[derive(Debug, Clone)]
pub struct BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
{
    capacity: usize,
    map: HashMap<K, V>,
    order: VecDeque<K>,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), map: HashMap::new(), order: VecDeque::new() }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    /// Inserts `value`, evicting the oldest entry first when the cache is full.
    ///
    /// Returns the evicted key, if any. Replacing an existing key keeps its slot.
    pub fn insert(&mut self, key: K, value: V) -> Option<K> {
        if let Some(existing) = self.map.get_mut(&key) {
            *existing = value;
            return None;
        }

        let mut evicted = None;
        if self.map.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
                evicted = Some(oldest);
            }
        }

        self.order.push_back(key.clone());
        self.map.insert(key, value);
        evicted
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }
}

/// Per-page text cache keyed by 1-based page number.
pub type PageTextCache = BoundedCache<u32, Arc<PageTextContent>>;
