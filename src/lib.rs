//! # stats-cache
//!
//! Stale-while-revalidate cache for expensive aggregated statistics: dashboard totals, warehouse summaries, and
//! anything else that takes seconds to compute but is fine to be a little behind.
//!
//! # The Basics
//!
//! The crate is designed for the following use case:
//!
//! - A slow, possibly failing, aggregation producing a single value per scope (a tenant, a company, a warehouse).
//! - Many readers asking for the same scope at the same time.
//! - A value a few minutes old is better than a spinner; a value of any age is better than an error.
//! - A restart should not mean a cold start.
//!
//! The cache operates on the following principles:
//!
//! - It is aggregator and storage agnostic: both are injected through the [`Aggregator`] and
//!   [`PersistentStore`](traits::PersistentStore) traits.
//! - Two layers. An in-memory one, implemented as a controller over the [moka](https://crates.io/crates/moka)
//!   cache, answers within a short TTL. A durable one answers within a longer TTL and survives restarts.
//! - At most one aggregation per scope is running at any time. Everybody interested in the scope shares it,
//!   including background revalidation.
//! - Aggregation failures never overwrite a good value and are only reported when there is nothing to fall back to.
//! - Persistence is best effort. A broken store makes the cache slower, never wrong.
//! - Scopes are fully independent; there is no global lock.
//! - Fully async, requires Tokio.
//!
//! # Aggregator
//!
//! The aggregator is the only piece the user has to provide. It also defines the key, value, and error types through
//! its associated types. The value must be serializable with serde since this is how it is persisted.

pub mod cache;
pub mod clock;
pub mod coalescer;
pub mod entry;
pub mod error;
pub mod memory;
pub mod persistent;
pub mod store;
pub mod traits;
pub mod types;

#[doc(inline)]
pub use cache::StatsCache;
#[doc(inline)]
pub use traits::Aggregator;

pub mod prelude {
    pub use crate::cache::StatsCache;
    pub use crate::entry::CacheEntry;
    pub use crate::error::{CacheError, StoreError};
    pub use crate::store::{FileStore, MemoryStore};
    pub use crate::traits::{Aggregator, Clock, PersistentStore};
    pub use crate::types::*;
}
