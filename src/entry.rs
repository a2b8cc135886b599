use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A successfully aggregated value along with the time it was obtained.
///
/// Entries are immutable. A refresh produces a new entry which replaces the old one as a whole, so a value never gets
/// paired with somebody else's timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
    value:      V,
    fetched_at: DateTime<Utc>,
    scope:      String,
}

impl<V> CacheEntry<V> {
    pub fn new(scope: impl Into<String>, value: V, fetched_at: DateTime<Utc>) -> Self {
        Self {
            value,
            fetched_at,
            scope: scope.into(),
        }
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn into_value(self) -> V {
        self.value
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Age of the entry at `now`. A timestamp from the future counts as zero age.
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.fetched_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_newer_than(&self, other: &Self) -> bool {
        self.fetched_at > other.fetched_at
    }
}

// Pick the most recent of two optional entries. On equal timestamps the first one wins.
pub(crate) fn newest<V>(a: Option<CacheEntry<V>>, b: Option<CacheEntry<V>>) -> Option<CacheEntry<V>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if b.is_newer_than(&a) { b } else { a }),
        (a, None) => a,
        (None, b) => b,
    }
}

// What actually goes into the persistent store. The scope is not stored since it is already encoded in the storage key.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StoredEntry<V> {
    pub(crate) value:      V,
    pub(crate) fetched_at: DateTime<Utc>,
}

impl<V: Clone> From<&CacheEntry<V>> for StoredEntry<V> {
    fn from(entry: &CacheEntry<V>) -> Self {
        Self {
            value:      entry.value.clone(),
            fetched_at: entry.fetched_at,
        }
    }
}

impl<V> StoredEntry<V> {
    pub(crate) fn into_entry(self, scope: impl Into<String>) -> CacheEntry<V> {
        CacheEntry::new(scope, self.value, self.fetched_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn test_age_never_negative() {
        let now = Utc::now();
        let entry = CacheEntry::new("acme", 1u32, now + TimeDelta::seconds(30));
        assert_eq!(entry.age_at(now), Duration::ZERO);

        let entry = CacheEntry::new("acme", 1u32, now - TimeDelta::seconds(30));
        assert_eq!(entry.age_at(now), Duration::from_secs(30));
    }

    #[test]
    fn test_newest() {
        let now = Utc::now();
        let old = CacheEntry::new("acme", "old", now - TimeDelta::seconds(5));
        let new = CacheEntry::new("acme", "new", now);

        assert_eq!(newest(Some(old.clone()), Some(new.clone())).map(|e| *e.value()), Some("new"));
        assert_eq!(newest(Some(new.clone()), Some(old.clone())).map(|e| *e.value()), Some("new"));
        assert_eq!(newest(None, Some(old.clone())).map(|e| *e.value()), Some("old"));
        assert_eq!(newest::<&str>(None, None), None);
    }
}
