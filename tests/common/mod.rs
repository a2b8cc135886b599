#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use stats_cache::clock::ManualClock;
use stats_cache::prelude::*;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub total: u64,
}

#[derive(Debug, thiserror::Error)]
#[error("aggregation failed: {0}")]
pub struct AggError(pub String);

/// Aggregator whose behavior is driven by the test: it counts invocations, can be slowed down, gated per scope,
/// made to fail, or made to panic.
#[derive(Debug)]
pub struct ScriptedAggregator {
    calls:     AtomicUsize,
    total:     AtomicU64,
    delay:     Mutex<Duration>,
    failing:   AtomicBool,
    panicking: AtomicBool,
    gated:     Mutex<HashSet<String>>,
    gate:      Semaphore,
    current:   Mutex<Option<String>>,
}

impl ScriptedAggregator {
    pub fn new(total: u64) -> Arc<Self> {
        Arc::new(Self {
            calls:     AtomicUsize::new(0),
            total:     AtomicU64::new(total),
            delay:     Mutex::new(Duration::ZERO),
            failing:   AtomicBool::new(false),
            panicking: AtomicBool::new(false),
            gated:     Mutex::new(HashSet::new()),
            gate:      Semaphore::new(0),
            current:   Mutex::new(None),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_panicking(&self, panicking: bool) {
        self.panicking.store(panicking, Ordering::SeqCst);
    }

    /// Fetches for `scope` block until [`open_gate`](Self::open_gate) is called.
    pub fn gate_scope(&self, scope: &str) {
        self.gated.lock().insert(scope.to_string());
    }

    pub fn open_gate(&self) {
        self.gate.add_permits(1_000);
    }

    pub fn set_current(&self, scope: Option<&str>) {
        *self.current.lock() = scope.map(String::from);
    }
}

#[async_trait]
impl Aggregator for ScriptedAggregator {
    type Error = AggError;
    type Key = String;
    type Value = Stats;

    async fn fetch(&self, key: &String) -> Result<Stats, AggError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let gated = self.gated.lock().contains(key);
        if gated {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|err| AggError(err.to_string()))?;
        }

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.panicking.load(Ordering::SeqCst) {
            panic!("aggregator panicked for '{key}'");
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(AggError(format!("upstream unavailable for '{key}'")));
        }

        Ok(Stats {
            total: self.total.load(Ordering::SeqCst),
        })
    }

    fn current_scope(&self) -> Option<String> {
        self.current.lock().clone()
    }
}

/// A store which refuses everything.
#[derive(Debug)]
pub struct BrokenStore;

#[async_trait]
impl PersistentStore for BrokenStore {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Err(StoreError::Unavailable("permission denied".into()))
    }

    async fn set(&self, _key: &str, _bytes: Vec<u8>) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("quota exceeded".into()))
    }

    async fn remove(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("permission denied".into()))
    }
}

pub fn build_cache(
    aggregator: &Arc<ScriptedAggregator>,
    store: Arc<dyn PersistentStore>,
    clock: &Arc<ManualClock>,
) -> StatsCache<ScriptedAggregator> {
    StatsCache::<ScriptedAggregator>::builder()
        .aggregator(Arc::clone(aggregator))
        .store(store)
        .clock(Arc::clone(clock) as Arc<dyn Clock>)
        .memory_ttl(Duration::from_secs(10))
        .persistent_ttl(Duration::from_secs(300))
        .name("test-stats")
        .build()
        .expect("cache builds")
}

/// Wait for the refresh of `scope`, if any, to complete.
pub async fn settle(cache: &StatsCache<ScriptedAggregator>, scope: &String) {
    for _ in 0..1_000 {
        if !cache.is_refreshing(scope) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("refresh of '{scope}' never completed");
}
