use crate::{entry::CacheEntry, traits::Aggregator};
use std::sync::Arc;

/// What a single aggregation produces; shared as-is between all coalesced waiters.
pub type Outcome<A> = Result<CacheEntry<<A as Aggregator>::Value>, Arc<<A as Aggregator>::Error>>;

/// Where a scope stands with respect to the cache TTLs.
///
/// Whether a refresh is currently running is orthogonal to this and is reported by
/// [`StatsCache::is_refreshing()`](crate::StatsCache::is_refreshing).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Nothing has ever been cached for the scope, or it was invalidated.
    Cold,
    /// The memory layer can answer without touching anything else.
    Fresh,
    /// The best known entry is past the memory TTL but still within the persistent one. It is served while a refresh
    /// runs in the background.
    StaleMemoryFreshPersistent,
    /// The best known entry is past both TTLs. Lookups wait for a refresh and only fall back to this entry if the
    /// refresh fails.
    StaleBoth,
}
