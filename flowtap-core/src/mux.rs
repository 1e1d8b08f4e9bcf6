//! Generic sub-parser cache: the mechanism behind both the IP and TCP
//! demultiplexers. Keyed by a canonical flow key, entries are reference
//! counted via `Arc` and evicted after a configurable idle timeout.
//!
//! Modeled on this corpus's `Arc<RwLock<AHashMap<...>>>` registry pattern,
//! but guarded by a `Mutex` rather than an `RwLock`: every hit also needs to
//! bump the entry's last-used timestamp, which is a write.

use std::collections::hash_map::Entry as MapEntry;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ahash::AHashMap;

struct Slot<V> {
    value: Arc<V>,
    last_used: Instant,
}

pub struct Mux<K, V> {
    table: Mutex<AHashMap<K, Slot<V>>>,
    timeout: Duration,
}

impl<K, V> Mux<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(capacity_hint: usize, timeout: Duration) -> Self {
        Self { table: Mutex::new(AHashMap::with_capacity(capacity_hint)), timeout }
    }

    /// Returns the cached sub-parser for `key`, creating one via `factory`
    /// on miss. The returned bool is `true` when a new entry was created.
    pub fn lookup_or_create<F>(&self, key: K, now: Instant, factory: F) -> (Arc<V>, bool)
    where
        F: FnOnce() -> V,
    {
        let mut table = self.table.lock().expect("mux mutex poisoned");
        match table.entry(key) {
            MapEntry::Occupied(mut occ) => {
                occ.get_mut().last_used = now;
                (occ.get().value.clone(), false)
            }
            MapEntry::Vacant(vac) => {
                let value = Arc::new(factory());
                vac.insert(Slot { value: value.clone(), last_used: now });
                (value, true)
            }
        }
    }

    pub fn lookup(&self, key: &K, now: Instant) -> Option<Arc<V>> {
        let mut table = self.table.lock().expect("mux mutex poisoned");
        table.get_mut(key).map(|slot| {
            slot.last_used = now;
            slot.value.clone()
        })
    }

    /// Deindexes `key` (e.g. on TCP connection termination). The sub-parser
    /// itself is dropped once every outstanding `Arc` clone is released.
    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        self.table.lock().expect("mux mutex poisoned").remove(key).map(|s| s.value)
    }

    /// Evicts every entry whose last access is older than the configured
    /// idle timeout, returning the evicted values for caller-side teardown.
    pub fn sweep_idle(&self, now: Instant) -> Vec<Arc<V>> {
        let mut table = self.table.lock().expect("mux mutex poisoned");
        let timeout = self.timeout;
        let mut evicted = Vec::new();
        table.retain(|_, slot| {
            let keep = now.duration_since(slot.last_used) < timeout;
            if !keep {
                evicted.push(slot.value.clone());
            }
            keep
        });
        evicted
    }

    /// Snapshots every live entry as `(key, value)` pairs. Used by
    /// maintenance sweeps that need to inspect entries without evicting
    /// them (e.g. checking each IP sub-parser's reassembly slots for a
    /// stalled fragment) — plain iteration, not an LRU-refreshing lookup.
    pub fn entries(&self) -> Vec<(K, Arc<V>)> {
        self.table.lock().expect("mux mutex poisoned").iter().map(|(k, s)| (k.clone(), s.value.clone())).collect()
    }

    pub fn len(&self) -> usize {
        self.table.lock().expect("mux mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_or_create_caches_a_single_entry_per_key() {
        let mux: Mux<u32, u32> = Mux::new(8, Duration::from_secs(60));
        let now = Instant::now();
        let (v1, created1) = mux.lookup_or_create(1, now, || 100);
        assert!(created1);
        let (v2, created2) = mux.lookup_or_create(1, now, || 999);
        assert!(!created2);
        assert_eq!(*v1, *v2);
        assert_eq!(mux.len(), 1);
    }

    #[test]
    fn sweep_idle_evicts_stale_entries() {
        let mux: Mux<u32, u32> = Mux::new(8, Duration::from_millis(1));
        let start = Instant::now();
        mux.lookup_or_create(1, start, || 1);
        std::thread::sleep(Duration::from_millis(5));
        let evicted = mux.sweep_idle(Instant::now());
        assert_eq!(evicted.len(), 1);
        assert!(mux.is_empty());
    }
}
