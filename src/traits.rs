use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::fmt::Display;
use std::hash::Hash;

use crate::error::StoreError;

// For types that are in charge of producing the statistics.
#[async_trait]
pub trait Aggregator: Sized + Send + Sync + 'static {
    /// The scope key type used with [`StatsCache::get_value()`](crate::StatsCache::get_value). Typically a tenant or
    /// company identifier.
    ///
    /// Its `Display` form is part of the persistent storage key, so it must be stable across process restarts.
    type Key: Debug + Display + Hash + Clone + Eq + Sized + Send + Sync + 'static;
    type Value: Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static;
    type Error: Display + Debug + Send + Sync + 'static;

    /// Produce a new snapshot of the statistics for the scope. May be slow and may fail. The cache guarantees that for
    /// any given key there is at most one call in progress.
    async fn fetch(&self, key: &Self::Key) -> Result<Self::Value, Self::Error>;

    /// The scope of the current caller; used by [`StatsCache::get_current()`](crate::StatsCache::get_current).
    /// Default implementation has no notion of a current scope.
    fn current_scope(&self) -> Option<Self::Key> {
        None
    }
}

/// Durable byte-oriented key-value storage surviving process restarts.
///
/// Implementations are expected to make single-key `get`/`set` atomic. Everything else, including key namespacing,
/// is the cache's business.
#[async_trait]
pub trait PersistentStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn set(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError>;
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Source of wall-clock time for entry timestamps.
pub trait Clock: Debug + Send + Sync + 'static {
    fn now(&self) -> chrono::DateTime<chrono::Utc>;
}
