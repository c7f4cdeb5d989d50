//! A sharded keyed lock-map.
//!
//! Used by the alarm engine and the SBO coordinator to serialise state
//! transitions per `(node_id, code)` / `(node_id, breaker_id)` key without
//! forcing every node through one global mutex (spec.md §9 design note:
//! "prefer a sharded lock-map keyed by ... over a single global mutex").

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use tokio::sync::Mutex;

const DEFAULT_SHARDS: usize = 16;

pub struct Sharded<K, V> {
    shards: Vec<Mutex<HashMap<K, V>>>,
}

impl<K, V> Sharded<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    pub fn with_shards(count: usize) -> Self {
        let mut shards = Vec::with_capacity(count.max(1));
        for _ in 0..count.max(1) {
            shards.push(Mutex::new(HashMap::new()));
        }
        Self { shards }
    }

    fn shard_index(&self, key: &K) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    /// Run `f` while holding the lock for the shard that owns `key`,
    /// serialising all access to that key (and any other key that happens
    /// to hash into the same shard).
    pub async fn with_entry<R>(&self, key: &K, f: impl FnOnce(&mut HashMap<K, V>) -> R) -> R {
        let idx = self.shard_index(key);
        let mut guard = self.shards[idx].lock().await;
        f(&mut guard)
    }

    /// Snapshot every entry across all shards. Used for read endpoints
    /// (`GET /alarms/active`) where per-key serialisation isn't needed.
    pub async fn snapshot(&self) -> Vec<V>
    where
        V: Clone,
    {
        let mut out = Vec::new();
        for shard in &self.shards {
            let guard = shard.lock().await;
            out.extend(guard.values().cloned());
        }
        out
    }
}

impl<K, V> Default for Sharded<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_and_snapshot_roundtrips() {
        let sharded: Sharded<String, i32> = Sharded::new();
        sharded
            .with_entry(&"a".to_string(), |m| m.insert("a".to_string(), 1))
            .await;
        sharded
            .with_entry(&"b".to_string(), |m| m.insert("b".to_string(), 2))
            .await;

        let mut values = sharded.snapshot().await;
        values.sort();
        assert_eq!(values, vec![1, 2]);
    }

    #[tokio::test]
    async fn same_key_always_maps_to_same_shard() {
        let sharded: Sharded<String, i32> = Sharded::with_shards(4);
        sharded
            .with_entry(&"node-1".to_string(), |m| m.insert("node-1".to_string(), 10))
            .await;
        let value = sharded
            .with_entry(&"node-1".to_string(), |m| m.get(&"node-1".to_string()).copied())
            .await;
        assert_eq!(value, Some(10));
    }
}
