//! Size- and time-bounded LRU cache.
//!
//! Used for descriptor-extraction memoization and manifest validation
//! results. Eviction is size-or-TTL; `shrink_to` supports the memory
//! monitor's pressure response.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Entry<V> {
    value: V,
    inserted_at: Instant,
    last_used: u64,
}

#[derive(Debug)]
pub struct TtlLru<K, V> {
    entries: HashMap<K, Entry<V>>,
    capacity: usize,
    ttl: Option<Duration>,
    tick: u64,
}

impl<K: Eq + Hash + Clone, V> TtlLru<K, V> {
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        assert!(capacity > 0, "lru capacity must be non-zero");
        Self {
            entries: HashMap::with_capacity(capacity),
            capacity,
            ttl,
            tick: 0,
        }
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.tick += 1;
        let tick = self.tick;
        let expired = match self.entries.get(key) {
            Some(entry) => self
                .ttl
                .is_some_and(|ttl| entry.inserted_at.elapsed() > ttl),
            None => return None,
        };
        if expired {
            self.entries.remove(key);
            return None;
        }
        let entry = self.entries.get_mut(key)?;
        entry.last_used = tick;
        Some(&entry.value)
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.tick += 1;
        if self.entries.len() >= self.capacity
            && !self.entries.contains_key(&key)
        {
            self.evict_one();
        }
        self.entries.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
                last_used: self.tick,
            },
        );
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|entry| entry.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops least-recently-used entries until at most
    /// `capacity * fraction` remain. Used on memory warnings.
    pub fn shrink_to(&mut self, fraction: f64) {
        let target =
            ((self.capacity as f64) * fraction.clamp(0.0, 1.0)) as usize;
        while self.entries.len() > target {
            self.evict_one();
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn evict_one(&mut self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone());
        if let Some(key) = victim {
            self.entries.remove(&key);
        }
    }
}

/// Thread-shared [`TtlLru`] that answers memory-pressure notifications:
/// shrink to half capacity on warn, flush on critical.
#[derive(Debug)]
pub struct SharedTtlLru<K, V> {
    inner: std::sync::Arc<parking_lot::Mutex<TtlLru<K, V>>>,
}

impl<K: Eq + Hash + Clone, V> SharedTtlLru<K, V> {
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            inner: std::sync::Arc::new(parking_lot::Mutex::new(
                TtlLru::new(capacity, ttl),
            )),
        }
    }

    pub fn lock(&self) -> parking_lot::MutexGuard<'_, TtlLru<K, V>> {
        self.inner.lock()
    }
}

impl<K, V> Clone for SharedTtlLru<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: std::sync::Arc::clone(&self.inner),
        }
    }
}

impl<K, V> crate::perf::memory::PressureSubscriber for SharedTtlLru<K, V>
where
    K: Eq + Hash + Clone + Send,
    V: Send,
{
    fn on_pressure(&self, pressure: crate::perf::memory::MemoryPressure) {
        let mut cache = self.inner.lock();
        match pressure {
            crate::perf::memory::MemoryPressure::Warn => cache.shrink_to(0.5),
            crate::perf::memory::MemoryPressure::Critical => cache.clear(),
            crate::perf::memory::MemoryPressure::Normal => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let mut lru = TtlLru::new(2, None);
        lru.insert("a", 1);
        lru.insert("b", 2);
        assert_eq!(lru.get(&"a"), Some(&1));
        lru.insert("c", 3);
        assert!(lru.get(&"b").is_none());
        assert_eq!(lru.get(&"a"), Some(&1));
        assert_eq!(lru.get(&"c"), Some(&3));
    }

    #[test]
    fn ttl_expires_entries() {
        let mut lru = TtlLru::new(4, Some(Duration::from_millis(10)));
        lru.insert("a", 1);
        assert_eq!(lru.get(&"a"), Some(&1));
        std::thread::sleep(Duration::from_millis(20));
        assert!(lru.get(&"a").is_none());
    }

    #[test]
    fn reinsert_updates_value_without_eviction() {
        let mut lru = TtlLru::new(2, None);
        lru.insert("a", 1);
        lru.insert("b", 2);
        lru.insert("a", 10);
        assert_eq!(lru.len(), 2);
        assert_eq!(lru.get(&"a"), Some(&10));
        assert_eq!(lru.get(&"b"), Some(&2));
    }

    #[test]
    fn shrink_to_halves_occupancy() {
        let mut lru = TtlLru::new(8, None);
        for i in 0..8 {
            lru.insert(i, i);
        }
        lru.shrink_to(0.5);
        assert_eq!(lru.len(), 4);
        // The most recently inserted entries survive.
        assert_eq!(lru.get(&7), Some(&7));
    }
}
