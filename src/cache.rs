use crate::{
    clock::SystemClock,
    coalescer::{Coalescer, InFlight},
    entry::newest,
    memory::MemoryLayer,
    persistent::PersistentLayer,
    prelude::*,
};
use chrono::{DateTime, Utc};
use fieldx::fxstruct;
use std::{sync::Arc, time::Duration};
use tracing::{debug, instrument, warn};

/// The coordinator. Serves aggregated statistics from memory, from the persistent store, or from a fresh aggregation;
/// whichever is the cheapest one that is still good enough.
///
/// ```ignore
/// let cache = StatsCache::<DashboardStats>::builder()
///     .aggregator(DashboardStats::new(api))
///     .store(Arc::new(FileStore::new("/var/cache/dashboard")))
///     .memory_ttl(Duration::from_secs(10))
///     .persistent_ttl(Duration::from_secs(300))
///     .key_prefix("dashboard-stats")
///     .build()?;
///
/// let stats = cache.get_value(&company_id, false).await?;
/// println!("{} as of {}", stats.value().total, stats.fetched_at());
/// ```
///
/// A lookup goes through the following steps:
///
/// 1. An entry younger than `memory_ttl` in the memory layer is returned right away.
/// 2. Otherwise, if the most recent entry known to either layer is younger than `persistent_ttl`, it is returned right
///    away too, and a refresh is started in the background. A persisted entry newer than the one in memory is copied
///    into memory on the way.
/// 3. Otherwise the caller waits for an aggregation. Concurrent callers of the same scope, including background
///    refreshes, share a single aggregation.
/// 4. If the aggregation fails, the most recent entry of any age is returned instead. Only a scope that never had a
///    value produces an error.
///
/// Must be used within a Tokio runtime: aggregations run in their own tasks, so a caller that stops waiting does not
/// cancel them.
#[fxstruct(sync, no_new, default(off), builder(error(CacheError<A::Error>), post_build(check_config)))]
pub struct StatsCache<A>
where
    A: Aggregator,
{
    #[fieldx(builder(required, into), get(clone))]
    aggregator: Arc<A>,

    #[fieldx(builder(required), get(clone))]
    store: Arc<dyn PersistentStore>,

    /// Cache name. Most useful for debugging and logging.
    #[fieldx(get(clone), builder(into), default(String::from("stats-cache")))]
    name: String,

    /// How long an entry is served from memory without any I/O.
    #[fieldx(get(copy), default(Duration::from_secs(10)))]
    memory_ttl: Duration,

    /// How long an entry is served at all without waiting for a refresh. Must not be shorter than `memory_ttl`.
    #[fieldx(get(copy), default(Duration::from_secs(300)))]
    persistent_ttl: Duration,

    /// Namespace of the storage keys: `<key_prefix>:<scope>`. Must not contain `:`.
    #[fieldx(get(clone), builder(into), default(String::from("stats")))]
    key_prefix: String,

    /// Maximum number of scopes kept in memory.
    #[fieldx(get(copy), default(10_000))]
    max_capacity: u64,

    #[fieldx(get(clone), default(Arc::new(SystemClock) as Arc<dyn Clock>))]
    clock: Arc<dyn Clock>,

    #[fieldx(lazy, private, fallible(error(CacheError<A::Error>)), get(clone), builder(off))]
    memory: Arc<MemoryLayer<A::Key, A::Value>>,

    #[fieldx(lazy, private, get(clone), builder(off))]
    persistent: Arc<PersistentLayer<A::Value>>,

    #[fieldx(lazy, private, get(clone), builder(off))]
    coalescer: Arc<Coalescer<A::Key, Outcome<A>>>,
}

impl<A> StatsCache<A>
where
    A: Aggregator,
{
    // Invoked by the builder. Initializes the memory layer, so a cache that got built is known to be valid.
    fn check_config(self) -> Result<Self, CacheError<A::Error>> {
        self.validate()?;
        Ok(self)
    }

    fn build_memory(&self) -> Result<Arc<MemoryLayer<A::Key, A::Value>>, CacheError<A::Error>> {
        let key_prefix = self.key_prefix();
        if key_prefix.contains(':') {
            return Err(CacheError::Config(format!(
                "key prefix '{key_prefix}' contains ':', storage keys would be ambiguous"
            )));
        }
        if self.memory_ttl() > self.persistent_ttl() {
            return Err(CacheError::Config(format!(
                "memory TTL ({:?}) exceeds persistent TTL ({:?})",
                self.memory_ttl(),
                self.persistent_ttl()
            )));
        }
        Ok(Arc::new(MemoryLayer::new(
            &self.name(),
            self.max_capacity(),
            self.memory_ttl(),
        )))
    }

    fn build_persistent(&self) -> Arc<PersistentLayer<A::Value>> {
        Arc::new(PersistentLayer::new(
            self.name(),
            self.store(),
            self.key_prefix(),
            self.persistent_ttl(),
        ))
    }

    fn build_coalescer(&self) -> Arc<Coalescer<A::Key, Outcome<A>>> {
        Arc::new(Coalescer::new())
    }

    #[inline]
    fn now(&self) -> DateTime<Utc> {
        self.clock().now()
    }

    /// Check the configuration. The builder does it too and refuses to build an invalid cache.
    pub fn validate(&self) -> Result<(), CacheError<A::Error>> {
        self.memory().map(|_| ())
    }

    /// Get the statistics for `scope`. With `force_refresh` the caches are bypassed and the caller waits for an
    /// aggregation; a failed one still falls back to the last known value.
    #[instrument(level = "trace", skip(self))]
    pub async fn get_value(
        &self,
        scope: &A::Key,
        force_refresh: bool,
    ) -> Result<CacheEntry<A::Value>, CacheError<A::Error>> {
        let memory = self.memory()?;
        let mut last_known = None;

        if !force_refresh {
            let now = self.now();
            let cached = memory.read(scope, now).await;

            if let Some((entry, true)) = cached {
                debug!("[{}] GET({scope}): memory hit", self.name());
                return Ok(entry);
            }

            let in_memory = cached.map(|(entry, _)| entry);
            let persisted = self.persistent().read(scope, now).await.map(|(entry, _)| entry);

            if let Some(ref persisted) = persisted {
                if in_memory.as_ref().map_or(true, |m| persisted.is_newer_than(m)) {
                    debug!("[{}] GET({scope}): hydrating memory from persistent store", self.name());
                    memory.write(scope, persisted.clone()).await;
                }
            }

            if let Some(candidate) = newest(in_memory, persisted) {
                let age = candidate.age_at(now);
                if self.persistent().is_servable(age) {
                    if age >= memory.ttl() {
                        debug!("[{}] GET({scope}): serving stale entry ({age:?} old), revalidating", self.name());
                        self.refresh_in_background(scope)?;
                    }
                    return Ok(candidate);
                }
                last_known = Some(candidate);
            }
        }

        debug!("[{}] GET({scope}): waiting for aggregation", self.name());

        let failure = match self.start_refresh(scope)?.wait().await {
            Some(Ok(entry)) => return Ok(entry),
            Some(Err(error)) => {
                debug!("[{}] GET({scope}): aggregation failed", self.name());
                CacheError::NeverLoaded {
                    scope: scope.to_string(),
                    error,
                }
            }
            None => {
                warn!("[{}] aggregation for '{scope}' terminated abnormally", self.name());
                CacheError::RefreshAborted {
                    scope: scope.to_string(),
                }
            }
        };

        match newest(last_known, self.last_known(scope).await?) {
            Some(entry) => {
                warn!(
                    "[{}] serving '{scope}' from {} instead",
                    self.name(),
                    entry.fetched_at()
                );
                Ok(entry)
            }
            None => Err(failure),
        }
    }

    /// Same as [`get_value()`](Self::get_value) for the scope reported by [`Aggregator::current_scope()`].
    pub async fn get_current(&self, force_refresh: bool) -> Result<CacheEntry<A::Value>, CacheError<A::Error>> {
        let scope = self.aggregator().current_scope().ok_or(CacheError::NoScope)?;
        self.get_value(&scope, force_refresh).await
    }

    /// Forget everything cached for `scope`. A refresh already in progress is not affected and stores its result
    /// when it completes.
    #[instrument(level = "trace", skip(self))]
    pub async fn invalidate(&self, scope: &A::Key) -> Result<(), CacheError<A::Error>> {
        debug!("[{}] INVALIDATE({scope})", self.name());
        self.memory()?.clear(scope).await;
        self.persistent().clear(scope).await;
        Ok(())
    }

    /// Make sure a refresh of `scope` is running without waiting for it. Returns `true` if a new aggregation has been
    /// started, `false` if one was already in progress.
    pub fn refresh_in_background(&self, scope: &A::Key) -> Result<bool, CacheError<A::Error>> {
        // The handle is dropped right away; this doesn't affect the aggregation.
        Ok(self.start_refresh(scope)?.is_leader())
    }

    /// Whether an aggregation for `scope` is in progress.
    pub fn is_refreshing(&self, scope: &A::Key) -> bool {
        self.coalescer().is_in_flight(scope)
    }

    /// Classify `scope` against the TTLs. Never triggers an aggregation.
    pub async fn state_of(&self, scope: &A::Key) -> Result<CacheState, CacheError<A::Error>> {
        let now = self.now();
        let memory = self.memory()?;

        if let Some((_, true)) = memory.read(scope, now).await {
            return Ok(CacheState::Fresh);
        }

        Ok(match self.last_known(scope).await? {
            None => CacheState::Cold,
            Some(entry) if self.persistent().is_servable(entry.age_at(now)) => CacheState::StaleMemoryFreshPersistent,
            Some(_) => CacheState::StaleBoth,
        })
    }

    // The most recent entry of any age known to either layer.
    async fn last_known(&self, scope: &A::Key) -> Result<Option<CacheEntry<A::Value>>, CacheError<A::Error>> {
        let now = self.now();
        let in_memory = self.memory()?.read(scope, now).await.map(|(entry, _)| entry);
        let persisted = self.persistent().read(scope, now).await.map(|(entry, _)| entry);
        Ok(newest(in_memory, persisted))
    }

    // Join the aggregation for `scope`, starting one if needed. The job stores its result in both layers before any
    // waiter is woken up, so by the time a caller gets the value the memory layer already has it.
    fn start_refresh(&self, scope: &A::Key) -> Result<InFlight<Outcome<A>>, CacheError<A::Error>> {
        let aggregator = self.aggregator();
        let memory = self.memory()?;
        let persistent = self.persistent();
        let clock = self.clock();
        let name = self.name();
        let key = scope.clone();

        Ok(self.coalescer().run_exclusive(scope.clone(), move || async move {
            debug!("[{name}] aggregating '{key}'");
            let value = match aggregator.fetch(&key).await {
                Ok(value) => value,
                // A failure leaves both layers untouched.
                Err(err) => {
                    warn!("[{name}] aggregation for '{key}' failed: {err}");
                    return Err(Arc::new(err));
                }
            };
            let entry = CacheEntry::new(key.to_string(), value, clock.now());
            memory.write(&key, entry.clone()).await;
            persistent.write(&key, &entry).await;
            Ok(entry)
        }))
    }
}
