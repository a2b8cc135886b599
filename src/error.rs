use fieldx::error::FieldXError;
use std::fmt::{Debug, Display};
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by [`StatsCache`](crate::StatsCache).
///
/// Only two of them can come out of a lookup: [`CacheError::NeverLoaded`] and [`CacheError::RefreshAborted`]. Both mean
/// that the scope has no cached value at all, neither fresh nor stale. Whenever anything has been cached before, the
/// last known value is returned instead.
#[derive(Debug, Error)]
pub enum CacheError<E>
where
    E: Display + Debug,
{
    #[error("statistics for scope '{scope}' have never been loaded: {error}")]
    NeverLoaded { scope: String, error: Arc<E> },

    #[error("aggregation for scope '{scope}' terminated before producing a result")]
    RefreshAborted { scope: String },

    #[error("no current scope could be resolved")]
    NoScope,

    #[error("invalid cache configuration: {0}")]
    Config(String),

    #[error("cannot build cache: {0}")]
    Builder(#[from] FieldXError),
}

impl<E> CacheError<E>
where
    E: Display + Debug,
{
    /// The aggregator error, if this is an aggregation failure.
    pub fn aggregation_error(&self) -> Option<&Arc<E>> {
        match self {
            Self::NeverLoaded { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Errors reported by [`PersistentStore`](crate::traits::PersistentStore) implementations.
///
/// The coordinator never propagates these; they only decide whether the persistent layer is used.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}
