//! Concurrent keyed storage for cache entries.
//!
//! The store is the single owner of entries. Bulk operations return
//! partitions of what actually happened so callers racing other writers can
//! reconcile, and the removal/update primitives accept an expected entry so
//! a stale caller never clobbers a concurrent replacement.
//!
//! Every structural mutation enqueues its storage-level change (and a count
//! snapshot) into the multiplexer while the map lock is still held, so the
//! observed event order always matches the commit order.

use std::hash::Hash;
use std::sync::Arc;

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::entry::CacheEntry;
use crate::events::CacheChange;
use crate::mux::Multiplexer;

pub(crate) struct KeyedStore<K, V> {
    map: RwLock<HashMap<K, Arc<CacheEntry<K, V>>, RandomState>>,
    mux: Arc<Multiplexer<K, V>>,
}

impl<K, V> KeyedStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub(crate) fn new(mux: Arc<Multiplexer<K, V>>) -> Self {
        Self {
            map: RwLock::new(HashMap::with_hasher(RandomState::default())),
            mux,
        }
    }

    /// Inserts the entry unless its key is already present.
    pub(crate) fn try_add(&self, entry: Arc<CacheEntry<K, V>>) -> bool {
        let mut map = self.map.write();
        if map.contains_key(entry.key()) {
            return false;
        }
        map.insert(entry.key().clone(), Arc::clone(&entry));
        self.mux.emit(CacheChange::added(&entry));
        self.mux.set_len(map.len());
        true
    }

    /// Inserts every entry whose key is free; returns the (added, rejected)
    /// partition.
    pub(crate) fn try_add_range(
        &self,
        entries: Vec<Arc<CacheEntry<K, V>>>,
    ) -> (Vec<Arc<CacheEntry<K, V>>>, Vec<Arc<CacheEntry<K, V>>>) {
        let mut added = Vec::new();
        let mut rejected = Vec::new();
        let mut map = self.map.write();
        for entry in entries {
            if map.contains_key(entry.key()) {
                rejected.push(entry);
            } else {
                map.insert(entry.key().clone(), Arc::clone(&entry));
                self.mux.emit(CacheChange::added(&entry));
                added.push(entry);
            }
        }
        self.mux.set_len(map.len());
        (added, rejected)
    }

    pub(crate) fn get(&self, key: &K) -> Option<Arc<CacheEntry<K, V>>> {
        self.map.read().get(key).cloned()
    }

    /// Looks every key up under one read lock.
    pub(crate) fn get_range(&self, keys: &[K]) -> Vec<(K, Option<Arc<CacheEntry<K, V>>>)> {
        let map = self.map.read();
        keys.iter()
            .map(|key| (key.clone(), map.get(key).cloned()))
            .collect()
    }

    pub(crate) fn contains(&self, key: &K) -> bool {
        self.map.read().contains_key(key)
    }

    /// Swaps the stored entry for `new`, returning the replaced one. With an
    /// `expected` entry the swap only happens if the slot still holds exactly
    /// that entry.
    pub(crate) fn try_update(
        &self,
        key: &K,
        new: Arc<CacheEntry<K, V>>,
        expected: Option<&Arc<CacheEntry<K, V>>>,
    ) -> Option<Arc<CacheEntry<K, V>>> {
        let mut map = self.map.write();
        let slot = map.get_mut(key)?;
        if let Some(expected) = expected {
            if !Arc::ptr_eq(slot, expected) {
                return None;
            }
        }
        let old = std::mem::replace(slot, Arc::clone(&new));
        self.mux
            .emit(CacheChange::replaced(&new, old.value().clone()));
        Some(old)
    }

    pub(crate) fn try_remove(&self, key: &K) -> Option<Arc<CacheEntry<K, V>>> {
        let mut map = self.map.write();
        let removed = map.remove(key)?;
        self.mux.emit(CacheChange::removed(&removed));
        self.mux.set_len(map.len());
        Some(removed)
    }

    /// Removes each key only while it still holds the expected entry;
    /// returns the (removed, kept) partition.
    pub(crate) fn try_remove_range(
        &self,
        expected: Vec<(K, Arc<CacheEntry<K, V>>)>,
    ) -> (
        Vec<Arc<CacheEntry<K, V>>>,
        Vec<(K, Arc<CacheEntry<K, V>>)>,
    ) {
        let mut removed = Vec::new();
        let mut kept = Vec::new();
        let mut map = self.map.write();
        for (key, expected_entry) in expected {
            let matches = map
                .get(&key)
                .map_or(false, |current| Arc::ptr_eq(current, &expected_entry));
            if matches {
                if let Some(entry) = map.remove(&key) {
                    self.mux.emit(CacheChange::removed(&entry));
                    removed.push(entry);
                }
            } else {
                kept.push((key, expected_entry));
            }
        }
        self.mux.set_len(map.len());
        (removed, kept)
    }

    /// Drains the store and returns the removed entries. Emits a single
    /// `Reset`, never per-entry removals; an empty clear emits nothing.
    pub(crate) fn clear(&self) -> Vec<Arc<CacheEntry<K, V>>> {
        let mut map = self.map.write();
        if map.is_empty() {
            return Vec::new();
        }
        let snapshot: Vec<Arc<CacheEntry<K, V>>> =
            map.drain().map(|(_, entry)| entry).collect();
        self.mux.emit(CacheChange::Reset);
        self.mux.set_len(0);
        snapshot
    }

    pub(crate) fn len(&self) -> usize {
        self.map.read().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    pub(crate) fn snapshot_keys(&self) -> Vec<K> {
        self.map.read().keys().cloned().collect()
    }

    pub(crate) fn snapshot_values(&self) -> Vec<V> {
        self.map
            .read()
            .values()
            .map(|entry| entry.value().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::ExpirationPolicy;
    use crate::errors::ErrorChannel;
    use tokio::runtime::Handle;

    fn store() -> KeyedStore<&'static str, u32> {
        let mux = Multiplexer::spawn(&Handle::current(), 64, usize::MAX, ErrorChannel::new(16));
        KeyedStore::new(mux)
    }

    fn entry(key: &'static str, value: u32) -> Arc<CacheEntry<&'static str, u32>> {
        CacheEntry::new(key, value, ExpirationPolicy::DoNothing, None)
    }

    #[tokio::test]
    async fn add_rejects_duplicate_keys() {
        let store = store();
        assert!(store.try_add(entry("a", 1)));
        assert!(!store.try_add(entry("a", 2)));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&"a").unwrap().value(), &1);
    }

    #[tokio::test]
    async fn add_range_partitions_results() {
        let store = store();
        store.try_add(entry("a", 1));
        let (added, rejected) =
            store.try_add_range(vec![entry("a", 10), entry("b", 2), entry("c", 3)]);
        assert_eq!(added.len(), 2);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].key(), &"a");
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn update_honors_expected_entry() {
        let store = store();
        let first = entry("a", 1);
        store.try_add(Arc::clone(&first));

        let stale = entry("a", 99);
        assert!(store
            .try_update(&"a", Arc::clone(&stale), Some(&stale))
            .is_none());

        let replaced = store.try_update(&"a", entry("a", 2), Some(&first));
        assert!(replaced.is_some());
        assert_eq!(store.get(&"a").unwrap().value(), &2);
    }

    #[tokio::test]
    async fn remove_range_keeps_replaced_entries() {
        let store = store();
        let a = entry("a", 1);
        let b = entry("b", 2);
        store.try_add(Arc::clone(&a));
        store.try_add(Arc::clone(&b));

        // "b" gets swapped before the bulk removal lands.
        store.try_update(&"b", entry("b", 20), None);

        let (removed, kept) = store.try_remove_range(vec![("a", a), ("b", b)]);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].key(), &"a");
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].0, "b");
        assert!(store.contains(&"b"));
    }

    #[tokio::test]
    async fn clear_returns_snapshot() {
        let store = store();
        store.try_add(entry("a", 1));
        store.try_add(entry("b", 2));
        let snapshot = store.clear();
        assert_eq!(snapshot.len(), 2);
        assert!(store.is_empty());
        assert!(store.clear().is_empty());
    }

    #[tokio::test]
    async fn snapshots_clone_current_state() {
        let store = store();
        store.try_add(entry("a", 1));
        store.try_add(entry("b", 2));
        let mut keys = store.snapshot_keys();
        keys.sort_unstable();
        assert_eq!(keys, vec!["a", "b"]);
        let mut values = store.snapshot_values();
        values.sort_unstable();
        assert_eq!(values, vec![1, 2]);
    }
}
