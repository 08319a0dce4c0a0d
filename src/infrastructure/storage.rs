//! In-process stream state storage.
//!
//! Provides concurrent, sharded storage for stream suppression state.

use crate::application::ports::{StoreError, StreamStore};
use crate::domain::policy::{Decision, Policy};
use crate::domain::stream::{StreamKey, StreamState};
use crate::domain::time::Timestamp;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Thread-safe sharded store backed by DashMap.
///
/// Each read-modify-write runs under the lock of the shard holding the key,
/// so decisions for one stream are linearized while other streams proceed in
/// parallel. No I/O happens while a shard lock is held.
#[derive(Debug, Default)]
pub struct LocalStore {
    map: DashMap<StreamKey, StreamState>,
}

impl LocalStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }

    /// Check if a stream is tracked.
    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }
}

impl StreamStore for LocalStore {
    fn get(&self, key: &StreamKey) -> Result<Option<StreamState>, StoreError> {
        Ok(self.map.get(key).map(|entry| *entry.value()))
    }

    fn put(&self, key: &StreamKey, state: StreamState) -> Result<(), StoreError> {
        self.map.insert(key.clone(), state);
        Ok(())
    }

    fn delete(&self, key: &StreamKey) -> Result<bool, StoreError> {
        Ok(self.map.remove(key).is_some())
    }

    fn scan(&self) -> Result<Vec<(StreamKey, StreamState)>, StoreError> {
        Ok(self
            .map
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect())
    }

    fn register_event(
        &self,
        key: &StreamKey,
        policy: &Policy,
        now: Timestamp,
    ) -> Result<Decision, StoreError> {
        // Fast path: existing stream, no key allocation.
        if let Some(mut state) = self.map.get_mut(key) {
            return Ok(state.register_event(policy, now));
        }

        let mut state = self
            .map
            .entry(key.clone())
            .or_insert_with(|| StreamState::fresh(now));
        Ok(state.register_event(policy, now))
    }

    fn remove_if_stale(
        &self,
        key: &StreamKey,
        cutoff: Timestamp,
    ) -> Result<Option<StreamState>, StoreError> {
        match self.map.entry(key.clone()) {
            Entry::Occupied(entry) if entry.get().is_stale(cutoff) => Ok(Some(entry.remove())),
            _ => Ok(None),
        }
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(self.map.len())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.map.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn policy() -> Policy {
        Policy::new(Duration::from_secs(10)).unwrap()
    }

    #[test]
    fn test_basic_operations() {
        let store = LocalStore::new();
        let key = StreamKey::from("a");
        let state = StreamState::fresh(Timestamp::from_secs(1));

        assert_eq!(store.get(&key).unwrap(), None);
        store.put(&key, state).unwrap();
        assert_eq!(store.get(&key).unwrap(), Some(state));
        assert_eq!(store.len().unwrap(), 1);
        assert!(store.contains("a"));

        assert!(store.delete(&key).unwrap());
        assert!(!store.delete(&key).unwrap());
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_register_event_creates_lazily() {
        let store = LocalStore::new();
        let key = StreamKey::from("lazy");
        let now = Timestamp::from_secs(100);

        assert_eq!(
            store.register_event(&key, &policy(), now).unwrap(),
            Decision::Allow
        );
        let state = store.get(&key).unwrap().unwrap();
        assert_eq!(state.next_valid_time, Timestamp::from_secs(110));
        assert_eq!(state.last_seen_time, now);
    }

    #[test]
    fn test_remove_if_stale_rechecks() {
        let store = LocalStore::new();
        let key = StreamKey::from("k");
        store
            .put(&key, StreamState::fresh(Timestamp::from_secs(50)))
            .unwrap();

        assert_eq!(
            store
                .remove_if_stale(&key, Timestamp::from_secs(40))
                .unwrap(),
            None
        );
        assert!(store.contains("k"));

        let removed = store
            .remove_if_stale(&key, Timestamp::from_secs(60))
            .unwrap();
        assert!(removed.is_some());
        assert!(!store.contains("k"));
        assert_eq!(
            store
                .remove_if_stale(&key, Timestamp::from_secs(60))
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_scan_and_clear() {
        let store = LocalStore::new();
        for name in ["x", "y", "z"] {
            store
                .put(&StreamKey::from(name), StreamState::fresh(Timestamp::EPOCH))
                .unwrap();
        }
        let mut keys: Vec<_> = store
            .scan()
            .unwrap()
            .into_iter()
            .map(|(k, _)| k.into_string())
            .collect();
        keys.sort();
        assert_eq!(keys, ["x", "y", "z"]);

        store.clear().unwrap();
        assert_eq!(store.len().unwrap(), 0);
    }

    #[test]
    fn test_concurrent_decisions_allow_exactly_once() {
        let store = Arc::new(LocalStore::new());
        let now = Timestamp::from_secs(1_000);
        let mut handles = vec![];

        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                let key = StreamKey::from("hot");
                (0..100)
                    .filter(|_| store.register_event(&key, &policy(), now).unwrap().is_allow())
                    .count()
            }));
        }

        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 1);

        let state = store.get(&StreamKey::from("hot")).unwrap().unwrap();
        assert_eq!(state.skipped_count, 799);
    }
}
