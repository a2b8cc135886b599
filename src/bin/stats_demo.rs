use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use rand::Rng;
use serde::{Deserialize, Serialize};
use stats_cache::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about = "Exercise dashboard and warehouse statistics caches against a simulated slow backend")]
struct Cli {
    /// Directory for persisted snapshots. Run twice with the same directory to see a warm start.
    #[arg(long, env = "STATS_CACHE_DIR", default_value = "stats-cache")]
    cache_dir: PathBuf,

    #[arg(long, env = "STATS_MEMORY_TTL_MS", default_value_t = 2_000)]
    memory_ttl_ms: u64,

    #[arg(long, env = "STATS_PERSISTENT_TTL_MS", default_value_t = 10_000)]
    persistent_ttl_ms: u64,

    /// Companies to query.
    #[arg(long, value_delimiter = ',', default_value = "acme,globex,initech")]
    companies: Vec<String>,

    /// Concurrent readers per company and round.
    #[arg(long, default_value_t = 8)]
    readers: usize,

    #[arg(long, default_value_t = 6)]
    rounds: usize,

    /// Pause between rounds.
    #[arg(long, default_value_t = 1_500)]
    pause_ms: u64,

    /// Probability of a simulated backend failure.
    #[arg(long, default_value_t = 0.2)]
    failure_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DashboardStats {
    open_invoices:           u64,
    scheduled_installations: u64,
    active_contracts:        u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WarehouseStats {
    items:     u64,
    low_stock: u64,
}

#[derive(Debug, thiserror::Error)]
#[error("backend request for '{0}' failed")]
struct BackendError(String);

// Pretends to talk to a remote API: slow and occasionally failing.
#[derive(Debug)]
struct SimulatedBackend {
    failure_rate: f64,
}

impl SimulatedBackend {
    async fn call(&self, company: &str) -> Result<u64, BackendError> {
        let (latency, fails, seed) = {
            let mut rng = rand::rng();
            (
                rng.random_range(150..600),
                rng.random_bool(self.failure_rate.clamp(0.0, 1.0)),
                rng.random_range(0..1_000),
            )
        };
        tokio::time::sleep(Duration::from_millis(latency)).await;
        if fails {
            Err(BackendError(company.to_string()))
        }
        else {
            Ok(seed)
        }
    }
}

struct DashboardAggregator(SimulatedBackend);

#[async_trait]
impl Aggregator for DashboardAggregator {
    type Error = BackendError;
    type Key = String;
    type Value = DashboardStats;

    async fn fetch(&self, company: &String) -> Result<DashboardStats, BackendError> {
        info!("dashboard: aggregating '{company}'");
        let (invoices, installations, contracts) =
            tokio::try_join!(self.0.call(company), self.0.call(company), self.0.call(company))?;
        Ok(DashboardStats {
            open_invoices:           invoices,
            scheduled_installations: installations,
            active_contracts:        contracts,
        })
    }
}

struct WarehouseAggregator(SimulatedBackend);

#[async_trait]
impl Aggregator for WarehouseAggregator {
    type Error = BackendError;
    type Key = String;
    type Value = WarehouseStats;

    async fn fetch(&self, company: &String) -> Result<WarehouseStats, BackendError> {
        info!("warehouse: aggregating '{company}'");
        let (items, low_stock) = tokio::try_join!(self.0.call(company), self.0.call(company))?;
        Ok(WarehouseStats {
            items,
            low_stock: low_stock % (items + 1),
        })
    }
}

async fn read_all<A>(label: &str, cache: Arc<StatsCache<A>>, companies: &[String], readers: usize)
where
    A: Aggregator<Key = String>,
{
    let readers = readers.max(1);
    let mut tasks = Vec::new();
    for company in companies {
        for _ in 0..readers {
            let cache = cache.clone();
            let company = company.clone();
            tasks.push(tokio::spawn(async move { cache.get_value(&company, false).await }));
        }
    }

    for (idx, task) in tasks.into_iter().enumerate() {
        // One line per company is enough.
        let report = idx % readers == 0;
        match task.await {
            Ok(Ok(entry)) if report => {
                info!("{label} {}: {:?} (as of {})", entry.scope(), entry.value(), entry.fetched_at())
            }
            Ok(Err(err)) if report => info!("{label}: {err}"),
            Err(err) => info!("{label}: reader task failed: {err}"),
            _ => (),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let store: Arc<dyn PersistentStore> = Arc::new(FileStore::new(&cli.cache_dir));
    let memory_ttl = Duration::from_millis(cli.memory_ttl_ms);
    let persistent_ttl = Duration::from_millis(cli.persistent_ttl_ms);

    let dashboard = Arc::new(
        StatsCache::<DashboardAggregator>::builder()
            .aggregator(DashboardAggregator(SimulatedBackend {
                failure_rate: cli.failure_rate,
            }))
            .store(store.clone())
            .name("dashboard")
            .key_prefix("dashboard-stats")
            .memory_ttl(memory_ttl)
            .persistent_ttl(persistent_ttl)
            .build()?,
    );

    // Warehouse figures move slower; give them twice the windows.
    let warehouse = Arc::new(
        StatsCache::<WarehouseAggregator>::builder()
            .aggregator(WarehouseAggregator(SimulatedBackend {
                failure_rate: cli.failure_rate,
            }))
            .store(store)
            .name("warehouse")
            .key_prefix("warehouse-stats")
            .memory_ttl(memory_ttl * 2)
            .persistent_ttl(persistent_ttl * 2)
            .build()?,
    );

    for round in 1..=cli.rounds {
        info!("round {round}/{}", cli.rounds);
        tokio::join!(
            read_all("dashboard", dashboard.clone(), &cli.companies, cli.readers),
            read_all("warehouse", warehouse.clone(), &cli.companies, cli.readers),
        );
        tokio::time::sleep(Duration::from_millis(cli.pause_ms)).await;
    }

    Ok(())
}
