use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use parking_lot::RwLock;

const SHARD_COUNT: usize = 32;

/// String-keyed concurrent map, sharded by key hash to keep write contention
/// local to one shard. Values are cloned out on read; callers store `Arc`-backed
/// handles when the payload is large.
pub struct ShardMap<V> {
    shards: Vec<RwLock<HashMap<String, V>>>,
}

impl<V: Clone> ShardMap<V> {
    pub fn new() -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self { shards }
    }

    fn shard(&self, key: &str) -> &RwLock<HashMap<String, V>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Inserts unconditionally, returning the previous value if any.
    pub fn insert(&self, key: impl Into<String>, value: V) -> Option<V> {
        let key = key.into();
        self.shard(&key).write().insert(key, value)
    }

    /// Inserts only when the key is vacant. Returns whether the value landed.
    pub fn insert_if_absent(&self, key: impl Into<String>, value: V) -> bool {
        let key = key.into();
        let mut shard = self.shard(&key).write();
        if shard.contains_key(&key) {
            return false;
        }
        shard.insert(key, value);
        true
    }

    /// Inserts or merges with the existing value under the shard lock.
    pub fn upsert<F>(&self, key: impl Into<String>, value: V, merge: F)
    where
        F: FnOnce(&V, V) -> V,
    {
        let key = key.into();
        let mut shard = self.shard(&key).write();
        let merged = match shard.get(&key) {
            Some(existing) => merge(existing, value),
            None => value,
        };
        shard.insert(key, merged);
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.shard(key).read().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.shard(key).read().contains_key(key)
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.shard(key).write().remove(key)
    }

    /// Removes the entry only when `predicate` holds for the current value,
    /// all under the shard lock. Returns the removed value.
    pub fn remove_if<F>(&self, key: &str, predicate: F) -> Option<V>
    where
        F: FnOnce(&V) -> bool,
    {
        let mut shard = self.shard(key).write();
        if shard.get(key).map(predicate).unwrap_or(false) {
            shard.remove(key)
        } else {
            None
        }
    }

    /// Point-in-time snapshot of all entries. Each shard is copied under its
    /// own read lock; callers iterate without holding any lock.
    pub fn snapshot(&self) -> Vec<(String, V)> {
        let mut entries = Vec::new();
        for shard in &self.shards {
            let guard = shard.read();
            entries.reserve(guard.len());
            for (key, value) in guard.iter() {
                entries.push((key.clone(), value.clone()));
            }
        }
        entries
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> Default for ShardMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn insert_get_remove() {
        let map = ShardMap::new();
        assert!(map.insert("a", 1).is_none());
        assert_eq!(map.insert("a", 2), Some(1));
        assert_eq!(map.get("a"), Some(2));
        assert_eq!(map.remove("a"), Some(2));
        assert!(map.get("a").is_none());
    }

    #[test]
    fn insert_if_absent_keeps_first_value() {
        let map = ShardMap::new();
        assert!(map.insert_if_absent("k", "first"));
        assert!(!map.insert_if_absent("k", "second"));
        assert_eq!(map.get("k"), Some("first"));
    }

    #[test]
    fn upsert_merges_existing() {
        let map = ShardMap::new();
        map.upsert("n", 10, |old, new| old + new);
        map.upsert("n", 5, |old, new| old + new);
        assert_eq!(map.get("n"), Some(15));
    }

    #[test]
    fn remove_if_respects_predicate() {
        let map = ShardMap::new();
        map.insert("k", 7);
        assert!(map.remove_if("k", |v| *v > 10).is_none());
        assert_eq!(map.get("k"), Some(7));
        assert_eq!(map.remove_if("k", |v| *v == 7), Some(7));
        assert!(map.get("k").is_none());
    }

    #[test]
    fn snapshot_covers_all_shards() {
        let map = ShardMap::new();
        for i in 0..200 {
            map.insert(format!("key-{i}"), i);
        }
        let snapshot = map.snapshot();
        assert_eq!(snapshot.len(), 200);
        assert_eq!(map.len(), 200);
    }

    #[test]
    fn concurrent_inserts_all_land() {
        let map = Arc::new(ShardMap::new());
        let mut handles = Vec::new();
        for t in 0..8 {
            let map = Arc::clone(&map);
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    map.insert(format!("t{t}-{i}"), i);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(map.len(), 800);
    }
}
