use crate::entry::CacheEntry;
use chrono::{DateTime, Utc};
use moka::{
    future::Cache,
    ops::compute::{CompResult, Op},
    policy::EvictionPolicy,
};
use std::{fmt::Debug, hash::Hash, time::Duration};

/// In-process layer holding the latest entry per scope.
///
/// The underlying moka cache is bounded by capacity only. Entries are never expired by time since an outdated entry is
/// still the fallback of last resort when aggregation fails. Freshness is judged by [`MemoryLayer::read`].
pub struct MemoryLayer<K, V>
where
    K: Debug + Hash + Clone + Eq + Send + Sync + 'static,
    V: Debug + Clone + Send + Sync + 'static,
{
    cache: Cache<K, CacheEntry<V>>,
    ttl:   Duration,
}

impl<K, V> MemoryLayer<K, V>
where
    K: Debug + Hash + Clone + Eq + Send + Sync + 'static,
    V: Debug + Clone + Send + Sync + 'static,
{
    pub fn new(name: &str, max_capacity: u64, ttl: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(max_capacity)
                .name(name)
                .eviction_policy(EvictionPolicy::lru())
                .build(),
            ttl,
        }
    }

    #[inline]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The entry for `key` and whether it is younger than the layer TTL at `now`.
    pub async fn read(&self, key: &K, now: DateTime<Utc>) -> Option<(CacheEntry<V>, bool)> {
        self.cache.get(key).await.map(|entry| {
            let is_fresh = entry.age_at(now) < self.ttl;
            (entry, is_fresh)
        })
    }

    /// Store `entry` unless the layer already holds a more recent one for the key. Returns `true` if the entry was
    /// stored.
    pub async fn write(&self, key: &K, entry: CacheEntry<V>) -> bool {
        let result = self
            .cache
            .entry(key.clone())
            .and_compute_with(|current| {
                let op = match current {
                    // Never back-date: a slow writer must not override what a later fetch has already put here.
                    Some(current) if current.value().is_newer_than(&entry) => Op::Nop,
                    _ => Op::Put(entry),
                };
                std::future::ready(op)
            })
            .await;

        !matches!(result, CompResult::Unchanged(_) | CompResult::StillNone(_))
    }

    pub async fn clear(&self, key: &K) {
        self.cache.invalidate(key).await;
    }
}
