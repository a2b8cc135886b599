use crate::entry::{CacheEntry, StoredEntry};
use crate::traits::PersistentStore;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fmt::Display,
    marker::PhantomData,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, warn};

/// Durable layer on top of a [`PersistentStore`].
///
/// Nothing this layer does can fail from the caller's point of view. Unreadable or undecodable records are misses;
/// failed writes are dropped by the [`best_effort_persist`](PersistentLayer::best_effort_persist) policy.
pub struct PersistentLayer<V> {
    store:   Arc<dyn PersistentStore>,
    prefix:  String,
    ttl:     Duration,
    name:    String,
    // Set by the first failed store operation, reset by the next successful one.
    failing: AtomicBool,
    _value:  PhantomData<fn() -> V>,
}

impl<V> PersistentLayer<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn PersistentStore>,
        prefix: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            ttl,
            name: name.into(),
            failing: AtomicBool::new(false),
            _value: PhantomData,
        }
    }

    #[inline]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether the last operation on the store failed.
    pub fn is_failing(&self) -> bool {
        self.failing.load(Ordering::Acquire)
    }

    // Only the first failure in a row is worth a warning; an unavailable store would otherwise flood the log on every
    // lookup.
    fn store_failed(&self, what: &str, key: &str, err: &dyn Display) {
        if self.failing.swap(true, Ordering::AcqRel) {
            debug!("[{}] {what} of '{key}' failed: {err}", self.name);
        }
        else {
            warn!("[{}] {what} of '{key}' failed, persistent layer unavailable: {err}", self.name);
        }
    }

    fn store_succeeded(&self) {
        if self.failing.swap(false, Ordering::AcqRel) {
            debug!("[{}] persistent layer is back", self.name);
        }
    }

    /// The storage key for a scope, e.g. `stats:acme`.
    pub fn storage_key(&self, scope: &impl Display) -> String {
        format!("{}:{scope}", self.prefix)
    }

    /// The stored entry for `scope` and its age at `now`.
    pub async fn read(&self, scope: &impl Display, now: DateTime<Utc>) -> Option<(CacheEntry<V>, Duration)> {
        let key = self.storage_key(scope);
        let bytes = match self.store.get(&key).await {
            Ok(found) => {
                self.store_succeeded();
                found?
            }
            Err(err) => {
                self.store_failed("read", &key, &err);
                return None;
            }
        };

        match serde_json::from_slice::<StoredEntry<V>>(&bytes) {
            Ok(stored) => {
                let entry = stored.into_entry(scope.to_string());
                let age = entry.age_at(now);
                Some((entry, age))
            }
            Err(err) => {
                warn!("[{}] discarding corrupted record '{key}': {err}", self.name);
                None
            }
        }
    }

    /// Whether an entry of this age is still within the persistent TTL.
    pub fn is_servable(&self, age: Duration) -> bool {
        age < self.ttl
    }

    #[inline]
    pub async fn write(&self, scope: &impl Display, entry: &CacheEntry<V>) -> bool {
        self.best_effort_persist(scope, entry).await
    }

    /// Write policy of the layer: try to store the entry, report whether it worked, never fail. Persisting is an
    /// optimization for the next cold start, so losing a write costs a fetch and nothing else.
    pub async fn best_effort_persist(&self, scope: &impl Display, entry: &CacheEntry<V>) -> bool {
        let key = self.storage_key(scope);
        let bytes = match serde_json::to_vec(&StoredEntry::from(entry)) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("[{}] cannot serialize entry for '{key}': {err}", self.name);
                return false;
            }
        };

        match self.store.set(&key, bytes).await {
            Ok(()) => {
                self.store_succeeded();
                debug!("[{}] persisted '{key}'", self.name);
                true
            }
            Err(err) => {
                self.store_failed("write", &key, &err);
                false
            }
        }
    }

    pub async fn clear(&self, scope: &impl Display) {
        let key = self.storage_key(scope);
        match self.store.remove(&key).await {
            Ok(()) => self.store_succeeded(),
            Err(err) => self.store_failed("removal", &key, &err),
        }
    }
}
