/// Bounded least-recently-used map (cache tier 1)
///
/// Capacity counts entries, not bytes. Recency is a monotonically increasing
/// tick per access; the oldest tick is the next victim.
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

#[derive(Debug)]
pub struct LruCache<K, V> {
    capacity: usize,
    entries: HashMap<K, (V, u64)>,
    recency: BTreeMap<u64, K>,
    tick: u64,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            tick: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Look up `key` and mark it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let tick = self.next_tick();
        let (value, last) = self.entries.get_mut(key)?;
        self.recency.remove(&*last);
        *last = tick;
        self.recency.insert(tick, key.clone());
        Some(&*value)
    }

    /// Look up `key` without touching its recency.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|(value, _)| value)
    }

    /// Insert or replace `key` as most recently used, then evict least
    /// recently used entries until the capacity holds. Evicted entries are
    /// handed back to the caller, oldest first.
    pub fn put(&mut self, key: K, value: V) -> Vec<(K, V)> {
        let tick = self.next_tick();
        if let Some((_, last)) = self.entries.insert(key.clone(), (value, tick)) {
            self.recency.remove(&last);
        }
        self.recency.insert(tick, key);

        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            let Some((_, victim)) = self.recency.pop_first() else {
                break;
            };
            if let Some((value, _)) = self.entries.remove(&victim) {
                evicted.push((victim, value));
            }
        }
        evicted
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let (value, last) = self.entries.remove(key)?;
        self.recency.remove(&last);
        Some(value)
    }

    /// Remove every entry, oldest first.
    pub fn drain(&mut self) -> Vec<(K, V)> {
        let order = std::mem::take(&mut self.recency);
        let mut drained = Vec::with_capacity(order.len());
        for (_, key) in order {
            if let Some((value, _)) = self.entries.remove(&key) {
                drained.push((key, value));
            }
        }
        self.entries.clear();
        drained
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.values().map(|(value, _)| value)
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}
