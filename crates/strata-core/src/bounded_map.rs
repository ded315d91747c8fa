//! Fixed-capacity map with CLOCK-style (LRU-K approximating) eviction.
//!
//! All entries live in a slot array allocated once at construction. Buckets
//! hold the head of an intrusive chain through the slot array and freed slots
//! are threaded onto a free list, so steady-state operation never allocates.
//!
//! Each live entry carries a usage counter in `0..=5`. Touching an entry bumps
//! the counter. When a slot is needed and the free list is empty, a clock hand
//! sweeps bucket by bucket: entries with a zero counter are evicted through the
//! eviction callback, all others are decremented. Hot entries therefore
//! survive several sweeps without any per-access list reordering.
//!
//! The map is not `Sync`: one instance belongs to one worker.

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::mem;

use crate::error::{CacheError, Result};

/// Counter ceiling; an entry touched this often survives five sweeps.
const MAX_USAGE: u8 = 5;

/// Fraction of buckets that may hold live entries.
pub const DEFAULT_LOAD_FACTOR: f32 = 0.6;

type EvictionCallback<K, V> = Box<dyn FnMut(K, V) + Send>;

struct Slot<K, V> {
    entry: Option<(K, V)>,
    usage: u8,
    /// Chain link while live, free-list link while free.
    next: Option<usize>,
}

pub struct BoundedHandleMap<K, V, S = RandomState> {
    buckets: Box<[Option<usize>]>,
    slots: Box<[Slot<K, V>]>,
    free: Option<usize>,
    len: usize,
    hand: usize,
    mask: usize,
    hasher: S,
    on_evict: EvictionCallback<K, V>,
}

impl<K: Hash + Eq, V> BoundedHandleMap<K, V> {
    /// Map with the default load factor and an eviction callback that just drops.
    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_eviction(capacity, DEFAULT_LOAD_FACTOR, |_, _| {})
    }

    /// Map with `capacity` buckets holding at most `round(capacity * load_factor)`
    /// entries. `on_evict` receives every entry reclaimed by a sweep or `clear`.
    pub fn with_eviction<F>(capacity: usize, load_factor: f32, on_evict: F) -> Result<Self>
    where
        F: FnMut(K, V) + Send + 'static,
    {
        Self::with_hasher(capacity, load_factor, on_evict, RandomState::new())
    }
}

impl<K: Hash + Eq, V, S: BuildHasher> BoundedHandleMap<K, V, S> {
    pub fn with_hasher<F>(capacity: usize, load_factor: f32, on_evict: F, hasher: S) -> Result<Self>
    where
        F: FnMut(K, V) + Send + 'static,
    {
        if !capacity.is_power_of_two() {
            return Err(CacheError::InvalidCapacity(capacity));
        }
        if !(load_factor > 0.0 && load_factor <= 1.0) {
            return Err(CacheError::InvalidLoadFactor(load_factor));
        }

        let max_entries = ((capacity as f32 * load_factor).round() as usize).max(1);
        let slots = (0..max_entries)
            .map(|i| Slot {
                entry: None,
                usage: 0,
                next: (i + 1 < max_entries).then_some(i + 1),
            })
            .collect();

        Ok(Self {
            buckets: vec![None; capacity].into_boxed_slice(),
            slots,
            free: Some(0),
            len: 0,
            hand: 0,
            mask: capacity - 1,
            hasher,
            on_evict: Box::new(on_evict),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of buckets.
    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    /// Upper bound on live entries.
    pub fn max_entries(&self) -> usize {
        self.slots.len()
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.find(key).is_some()
    }

    /// Look up `key`, marking it as recently used.
    pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let (_, _, i) = self.find(key)?;
        let slot = &mut self.slots[i];
        slot.usage = (slot.usage + 1).min(MAX_USAGE);
        slot.entry.as_ref().map(|(_, v)| v)
    }

    /// Insert or replace. A replaced value is handed back to the caller and
    /// does not go through the eviction callback.
    pub fn put(&mut self, key: K, value: V) -> Option<V> {
        if let Some((_, _, i)) = self.find(&key) {
            let slot = &mut self.slots[i];
            slot.usage = (slot.usage + 1).min(MAX_USAGE);
            if let Some((_, current)) = slot.entry.as_mut() {
                return Some(mem::replace(current, value));
            }
        }

        // Sweeping before linking keeps the new entry out of reach of the hand.
        let i = self.allocate();
        let bucket = self.bucket_of(&key);
        let slot = &mut self.slots[i];
        slot.entry = Some((key, value));
        slot.usage = 1;
        slot.next = self.buckets[bucket];
        self.buckets[bucket] = Some(i);
        self.len += 1;
        None
    }

    /// Unlink `key` and return its value without invoking the callback.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let (bucket, prev, i) = self.find(key)?;
        self.unlink(bucket, prev, i);
        self.release(i).map(|(_, v)| v)
    }

    /// Evict every entry through the callback.
    pub fn clear(&mut self) {
        for bucket in 0..self.buckets.len() {
            let mut cursor = self.buckets[bucket].take();
            while let Some(i) = cursor {
                cursor = self.slots[i].next;
                if let Some((k, v)) = self.release(i) {
                    (self.on_evict)(k, v);
                }
            }
        }
        self.hand = 0;
    }

    fn bucket_of<Q>(&self, key: &Q) -> usize
    where
        Q: Hash + ?Sized,
    {
        (self.hasher.hash_one(key) as usize) & self.mask
    }

    /// Returns `(bucket, previous slot in chain, slot)`.
    fn find<Q>(&self, key: &Q) -> Option<(usize, Option<usize>, usize)>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let bucket = self.bucket_of(key);
        let mut prev = None;
        let mut cursor = self.buckets[bucket];
        while let Some(i) = cursor {
            let slot = &self.slots[i];
            if let Some((k, _)) = &slot.entry
                && k.borrow() == key
            {
                return Some((bucket, prev, i));
            }
            prev = Some(i);
            cursor = slot.next;
        }
        None
    }

    fn allocate(&mut self) -> usize {
        loop {
            if let Some(i) = self.free {
                self.free = self.slots[i].next;
                return i;
            }
            self.sweep();
        }
    }

    /// Advance the clock hand until one entry has been evicted.
    ///
    /// Counters are bounded, so this finishes within `MAX_USAGE + 1` laps.
    fn sweep(&mut self) {
        if self.len == 0 {
            return;
        }
        loop {
            let bucket = self.hand;
            self.hand = (self.hand + 1) & self.mask;

            let mut prev = None;
            let mut cursor = self.buckets[bucket];
            while let Some(i) = cursor {
                cursor = self.slots[i].next;
                if self.slots[i].usage == 0 {
                    self.unlink(bucket, prev, i);
                    if let Some((k, v)) = self.release(i) {
                        (self.on_evict)(k, v);
                    }
                    return;
                }
                self.slots[i].usage -= 1;
                prev = Some(i);
            }
        }
    }

    fn unlink(&mut self, bucket: usize, prev: Option<usize>, i: usize) {
        let next = self.slots[i].next;
        match prev {
            Some(p) => self.slots[p].next = next,
            None => self.buckets[bucket] = next,
        }
    }

    /// Return slot `i` to the free list. The slot must already be unlinked.
    fn release(&mut self, i: usize) -> Option<(K, V)> {
        let slot = &mut self.slots[i];
        let entry = slot.entry.take();
        slot.usage = 0;
        slot.next = self.free;
        self.free = Some(i);
        if entry.is_some() {
            self.len -= 1;
        }
        entry
    }
}

impl<K, V, S> fmt::Debug for BoundedHandleMap<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedHandleMap")
            .field("len", &self.len)
            .field("capacity", &self.buckets.len())
            .field("max_entries", &self.slots.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn recording_map(
        capacity: usize,
        load_factor: f32,
    ) -> (BoundedHandleMap<String, u32>, Arc<Mutex<Vec<String>>>) {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let sink = evicted.clone();
        let map = BoundedHandleMap::with_eviction(capacity, load_factor, move |k: String, _| {
            sink.lock().push(k)
        })
        .unwrap();
        (map, evicted)
    }

    fn usage_of(map: &BoundedHandleMap<String, u32>, key: &str) -> u8 {
        let (_, _, i) = map.find(key).expect("key present");
        map.slots[i].usage
    }

    #[test]
    fn test_rejects_bad_dimensions() {
        assert!(matches!(
            BoundedHandleMap::<String, u32>::new(1000),
            Err(CacheError::InvalidCapacity(1000))
        ));
        assert!(matches!(
            BoundedHandleMap::<String, u32>::new(0),
            Err(CacheError::InvalidCapacity(0))
        ));
        assert!(BoundedHandleMap::<String, u32>::with_eviction(16, 0.0, |_, _| {}).is_err());
        assert!(BoundedHandleMap::<String, u32>::with_eviction(16, 1.5, |_, _| {}).is_err());
    }

    #[test]
    fn test_max_entries_follows_load_factor() {
        let map = BoundedHandleMap::<String, u32>::new(1024).unwrap();
        assert_eq!(map.capacity(), 1024);
        assert_eq!(map.max_entries(), 614);
    }

    #[test]
    fn test_put_get_remove() {
        let mut map = BoundedHandleMap::new(16).unwrap();
        assert_eq!(map.put("a".to_string(), 1), None);
        assert_eq!(map.put("b".to_string(), 2), None);
        assert_eq!(map.get("a"), Some(&1));
        assert_eq!(map.put("a".to_string(), 10), Some(1));
        assert_eq!(map.get("a"), Some(&10));
        assert_eq!(map.len(), 2);

        assert_eq!(map.remove("a"), Some(10));
        assert_eq!(map.remove("a"), None);
        assert!(!map.contains_key("a"));
        assert!(map.contains_key("b"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_lookups_survive_bucket_collisions() {
        // Two buckets force long chains.
        let mut map = BoundedHandleMap::with_eviction(2, 1.0, |_: String, _: u32| {}).unwrap();
        map.put("x".to_string(), 1);
        map.put("y".to_string(), 2);
        assert_eq!(map.get("x"), Some(&1));
        assert_eq!(map.get("y"), Some(&2));
        assert_eq!(map.get("z"), None);
        assert_eq!(map.remove("y"), Some(2));
        assert_eq!(map.get("x"), Some(&1));
    }

    #[test]
    fn test_usage_counter_is_capped() {
        let mut map = BoundedHandleMap::new(16).unwrap();
        map.put("a".to_string(), 1);
        assert_eq!(usage_of(&map, "a"), 1);
        for _ in 0..10 {
            map.get("a");
        }
        assert_eq!(usage_of(&map, "a"), MAX_USAGE);
    }

    #[test]
    fn test_live_size_never_exceeds_bound() {
        let (mut map, evicted) = recording_map(16, 0.5);
        for i in 0..100u32 {
            map.put(format!("k{i}"), i);
            assert!(map.len() <= map.max_entries());
        }
        assert_eq!(map.len(), 8);
        assert_eq!(evicted.lock().len(), 92);
    }

    #[test]
    fn test_never_evicts_the_entry_being_inserted() {
        let (mut map, evicted) = recording_map(2, 0.5);
        assert_eq!(map.max_entries(), 1);
        map.put("a".to_string(), 1);
        map.put("b".to_string(), 2);
        assert_eq!(map.get("b"), Some(&2));
        assert!(!map.contains_key("a"));
        assert_eq!(*evicted.lock(), vec!["a".to_string()]);
    }

    #[test]
    fn test_hot_entry_outlives_cold_ones() {
        let (mut map, evicted) = recording_map(16, 0.5);
        map.put("hot".to_string(), 0);
        for i in 0..7u32 {
            map.put(format!("cold{i}"), i);
        }
        for _ in 0..4 {
            map.get("hot");
        }

        for i in 0..8u32 {
            map.put(format!("new{i}"), i);
        }

        assert!(map.contains_key("hot"));
        assert_eq!(map.len(), 8);
        let evicted = evicted.lock();
        assert_eq!(evicted.len(), 8);
        assert!(!evicted.iter().any(|k| k == "hot"));
    }

    #[test]
    fn test_clear_evicts_everything_through_callback() {
        let (mut map, evicted) = recording_map(16, 0.5);
        for i in 0..5u32 {
            map.put(format!("k{i}"), i);
        }
        map.clear();
        assert!(map.is_empty());
        assert_eq!(evicted.lock().len(), 5);

        // Slots are recycled after a clear.
        for i in 0..8u32 {
            map.put(format!("again{i}"), i);
        }
        assert_eq!(map.len(), 8);
        assert_eq!(evicted.lock().len(), 5);
    }

    #[test]
    fn test_remove_does_not_invoke_callback() {
        let (mut map, evicted) = recording_map(16, 0.5);
        map.put("a".to_string(), 1);
        assert_eq!(map.remove("a"), Some(1));
        assert!(evicted.lock().is_empty());
    }
}
