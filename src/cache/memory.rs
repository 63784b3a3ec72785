//! In-memory LRU cache with cost and count limits.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

use tracing::debug;

use crate::cache::lru::LruList;

/// Default cost limit: a fraction of physical memory, clamped to `i32::MAX`.
/// The fraction is 10% up to 512 MiB of RAM, 20% above.
pub fn default_cost_limit() -> u64 {
    const MIB: u64 = 1024 * 1024;
    let physical = physical_memory().unwrap_or(512 * MIB);
    let ratio = if physical <= 512 * MIB { 0.1 } else { 0.2 };
    ((physical as f64 * ratio) as u64).min(i32::MAX as u64)
}

#[cfg(target_os = "linux")]
fn physical_memory() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

#[cfg(not(target_os = "linux"))]
fn physical_memory() -> Option<u64> {
    None
}

struct Entry<K, V> {
    key: K,
    value: V,
    cost: u64,
}

struct CacheState<K, V> {
    map: HashMap<K, usize>,
    list: LruList<Entry<K, V>>,
    total_cost: u64,
    cost_limit: u64,
    count_limit: usize,
}

/// LRU map bounded by total cost and entry count.
///
/// All operations are serialized behind one lock; every critical section is
/// O(1) apart from eviction loops, which do O(1) work per evicted entry.
pub struct MemoryCache<K, V> {
    state: Mutex<CacheState<K, V>>,
}

impl<K, V> MemoryCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(cost_limit: u64, count_limit: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                map: HashMap::new(),
                list: LruList::new(),
                total_cost: 0,
                cost_limit,
                count_limit,
            }),
        }
    }

    /// Returns the value and promotes the entry to most recently used.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut state = self.state.lock().unwrap();
        let index = *state.map.get(key)?;
        state.list.move_to_front(index);
        state.list.get(index).map(|entry| entry.value.clone())
    }

    /// Inserts the value, replacing any entry with the same key, then trims
    /// back within limits.
    pub fn set(&self, key: K, value: V, cost: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(index) = state.map.remove(&key) {
            let old = state.list.remove(index);
            state.total_cost -= old.cost;
        }
        let index = state.list.push_front(Entry {
            key: key.clone(),
            value,
            cost,
        });
        state.map.insert(key, index);
        state.total_cost += cost;
        let (cost_limit, count_limit) = (state.cost_limit, state.count_limit);
        Self::trim(&mut state, cost_limit, count_limit);
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut state = self.state.lock().unwrap();
        let index = state.map.remove(key)?;
        let entry = state.list.remove(index);
        state.total_cost -= entry.cost;
        Some(entry.value)
    }

    pub fn remove_all(&self) {
        let mut state = self.state.lock().unwrap();
        state.map.clear();
        state.list.clear();
        state.total_cost = 0;
    }

    pub fn trim_to_cost(&self, cost: u64) {
        let mut state = self.state.lock().unwrap();
        let count_limit = state.count_limit;
        Self::trim(&mut state, cost, count_limit);
    }

    pub fn trim_to_count(&self, count: usize) {
        let mut state = self.state.lock().unwrap();
        let cost_limit = state.cost_limit;
        Self::trim(&mut state, cost_limit, count);
    }

    /// Pressure hook: shrink to a fraction of both limits (e.g. 0.1 when the
    /// process moves to the background).
    pub fn trim_to_fraction(&self, fraction: f64) {
        let mut state = self.state.lock().unwrap();
        let cost = (state.cost_limit as f64 * fraction) as u64;
        let count = (state.count_limit as f64 * fraction) as usize;
        Self::trim(&mut state, cost, count);
    }

    pub fn total_cost(&self) -> u64 {
        self.state.lock().unwrap().total_cost
    }

    pub fn total_count(&self) -> usize {
        self.state.lock().unwrap().list.len()
    }

    pub fn cost_limit(&self) -> u64 {
        self.state.lock().unwrap().cost_limit
    }

    pub fn count_limit(&self) -> usize {
        self.state.lock().unwrap().count_limit
    }

    fn trim(state: &mut CacheState<K, V>, cost_limit: u64, count_limit: usize) {
        let mut evicted = 0usize;
        while state.total_cost > cost_limit || state.list.len() > count_limit {
            let Some((_, entry)) = state.list.pop_back() else {
                break;
            };
            state.map.remove(&entry.key);
            state.total_cost -= entry.cost;
            evicted += 1;
        }
        if evicted > 0 {
            debug!(evicted, total_cost = state.total_cost, "memory cache trimmed");
        }
    }
}
