//! Segmented LRU map.
//!
//! New entries land in the probational segment. A hit on a probational entry
//! promotes it to the protected segment; protected overflow is demoted back to
//! the most-recent end of the probational segment, and probational overflow is
//! evicted through the optional callback.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

pub type EvictedFn<K, V> = Box<dyn Fn(K, V) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment {
    Probational,
    Protected,
}

struct Slot<V> {
    value: V,
    segment: Segment,
    tick: u64,
}

pub struct SlruMap<K, V> {
    protected_capacity: usize,
    probational_capacity: usize,
    entries: HashMap<K, Slot<V>>,
    protected: BTreeMap<u64, K>,
    probational: BTreeMap<u64, K>,
    clock: u64,
    evicted_fn: Option<EvictedFn<K, V>>,
    stats: CacheStats,
}

impl<K, V> fmt::Debug for SlruMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlruMap")
            .field("protected_capacity", &self.protected_capacity)
            .field("probational_capacity", &self.probational_capacity)
            .field("len", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl<K, V> SlruMap<K, V>
where
    K: Eq + Hash + Clone,
{
    #[must_use]
    pub fn new(protected_capacity: usize, probational_capacity: usize) -> Self {
        Self {
            protected_capacity: protected_capacity.max(1),
            probational_capacity: probational_capacity.max(1),
            entries: HashMap::new(),
            protected: BTreeMap::new(),
            probational: BTreeMap::new(),
            clock: 0,
            evicted_fn: None,
            stats: CacheStats::default(),
        }
    }

    #[must_use]
    pub fn with_evicted_fn(mut self, evicted_fn: EvictedFn<K, V>) -> Self {
        self.evicted_fn = Some(evicted_fn);
        self
    }

    /// Looks up `key`, refreshing its recency and promoting it when it was probational.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let Some(slot) = self.entries.get(key) else {
            self.stats.miss();
            return None;
        };
        self.stats.hit();
        let (segment, tick) = (slot.segment, slot.tick);
        match segment {
            Segment::Protected => {
                self.protected.remove(&tick);
            }
            Segment::Probational => {
                self.probational.remove(&tick);
            }
        }
        let tick = self.next_tick();
        self.protected.insert(tick, key.clone());
        if let Some(slot) = self.entries.get_mut(key) {
            slot.segment = Segment::Protected;
            slot.tick = tick;
        }
        self.rebalance();
        self.entries.get(key).map(|slot| &slot.value)
    }

    /// Looks up `key` without touching recency or stats.
    #[must_use]
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|slot| &slot.value)
    }

    pub fn put(&mut self, key: K, value: V) {
        if let Some(slot) = self.entries.get_mut(&key) {
            slot.value = value;
            return;
        }
        let tick = self.next_tick();
        self.probational.insert(tick, key.clone());
        self.entries.insert(
            key,
            Slot {
                value,
                segment: Segment::Probational,
                tick,
            },
        );
        self.rebalance();
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.entries.remove(key)?;
        match slot.segment {
            Segment::Protected => self.protected.remove(&slot.tick),
            Segment::Probational => self.probational.remove(&slot.tick),
        };
        Some(slot.value)
    }

    /// Drops every entry. The eviction callback is not invoked.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.protected.clear();
        self.probational.clear();
    }

    /// Removes every entry, handing each to `f`.
    pub fn drain_with(&mut self, mut f: impl FnMut(K, V)) {
        self.protected.clear();
        self.probational.clear();
        for (key, slot) in self.entries.drain() {
            f(key, slot.value);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `(hits, misses)`.
    #[must_use]
    pub fn stats(&self) -> (u64, u64) {
        self.stats.get()
    }

    fn next_tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn rebalance(&mut self) {
        while self.protected.len() > self.protected_capacity {
            let Some((_, key)) = self.protected.pop_first() else {
                break;
            };
            let tick = self.next_tick();
            self.probational.insert(tick, key.clone());
            if let Some(slot) = self.entries.get_mut(&key) {
                slot.segment = Segment::Probational;
                slot.tick = tick;
            }
        }
        while self.probational.len() > self.probational_capacity {
            let Some((_, key)) = self.probational.pop_first() else {
                break;
            };
            if let Some(slot) = self.entries.remove(&key) {
                if let Some(evicted_fn) = &self.evicted_fn {
                    evicted_fn(key, slot.value);
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn probational_overflow_evicts_oldest() {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&evicted);
        let mut map = SlruMap::new(2, 2).with_evicted_fn(Box::new(move |k: u32, v: &'static str| {
            sink.lock().unwrap().push((k, v));
        }));
        map.put(1, "a");
        map.put(2, "b");
        map.put(3, "c");
        assert_eq!(map.len(), 2);
        assert!(map.peek(&1).is_none());
        assert_eq!(*evicted.lock().unwrap(), vec![(1, "a")]);
    }

    #[test]
    fn hit_entries_survive_a_scan() {
        let mut map = SlruMap::new(2, 2);
        map.put(1, 10);
        assert_eq!(map.get(&1), Some(&10));
        for key in 2..10 {
            map.put(key, key * 10);
        }
        assert_eq!(map.peek(&1), Some(&10), "protected entry must not be scanned out");
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn protected_overflow_demotes_instead_of_dropping() {
        let mut map = SlruMap::new(1, 4);
        map.put(1, 1);
        map.put(2, 2);
        map.get(&1);
        map.get(&2);
        assert_eq!(map.len(), 2);
        assert_eq!(map.peek(&1), Some(&1));
    }

    #[test]
    fn stats_and_remove() {
        let mut map = SlruMap::new(4, 4);
        map.put("k", 1);
        assert!(map.get(&"k").is_some());
        assert!(map.get(&"missing").is_none());
        assert_eq!(map.stats(), (1, 1));
        assert_eq!(map.remove(&"k"), Some(1));
        assert!(map.is_empty());
    }

    #[test]
    fn drain_hands_out_every_entry() {
        let mut map = SlruMap::new(4, 4);
        map.put(1, 'a');
        map.put(2, 'b');
        map.get(&2);
        let mut seen = Vec::new();
        map.drain_with(|k, v| seen.push((k, v)));
        seen.sort_unstable();
        assert_eq!(seen, vec![(1, 'a'), (2, 'b')]);
        assert!(map.is_empty());
    }
}
