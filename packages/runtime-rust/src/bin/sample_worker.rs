//! Sample worker: runs the reference workflows on an in-process bus.
//!
//! Starts one instance of each workflow, waits for the bus to go idle, and
//! keeps consuming until Ctrl-C.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, ValueEnum};
use simplebus_runtime::config::{BusConfig, LockConfig, TransportConfig};
use simplebus_runtime::samples::{self, import_evaluator, publish_agent, train_models, WorkDelay};
use simplebus_runtime::storage::{MemoryStateStore, StateStore};
use simplebus_runtime::BusBuilder;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    Memory,
    #[cfg(feature = "redb")]
    Redb,
}

#[derive(Debug, Parser)]
#[command(name = "sample-worker", about = "Runs the simplebus reference workflows")]
struct Args {
    /// Identifier attached to log spans.
    #[arg(long, env = "SIMPLEBUS_NODE_ID", default_value = "sample-worker")]
    node_id: String,

    /// State store engine.
    #[arg(long, env = "SIMPLEBUS_STORE", value_enum, default_value = "memory")]
    store: StoreKind,

    /// Database file for the durable store.
    #[arg(long, env = "SIMPLEBUS_STORE_PATH", default_value = "simplebus-state.redb")]
    store_path: PathBuf,

    /// Lease lifetime in milliseconds.
    #[arg(long, env = "SIMPLEBUS_LEASE_TTL_MS", default_value_t = 25_000)]
    lease_ttl_ms: u64,

    /// Lock poll interval in milliseconds.
    #[arg(long, env = "SIMPLEBUS_LOCK_POLL_MS", default_value_t = 1_000)]
    lock_poll_ms: u64,

    /// Maximum deliveries routed concurrently.
    #[arg(long, env = "SIMPLEBUS_PREFETCH", default_value_t = 64)]
    prefetch: u32,

    /// Simulated work per task handler, in milliseconds.
    #[arg(long, env = "SIMPLEBUS_WORK_MS", default_value_t = 500)]
    work_ms: u64,

    /// Serve Prometheus metrics on this address.
    #[arg(long, env = "SIMPLEBUS_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Emit logs as JSON.
    #[arg(long, env = "SIMPLEBUS_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn bus_config(&self) -> BusConfig {
        BusConfig {
            node_id: self.node_id.clone(),
            lock: LockConfig {
                lease_ttl: Duration::from_millis(self.lease_ttl_ms),
                poll_interval: Duration::from_millis(self.lock_poll_ms),
            },
            transport: TransportConfig {
                prefetch: self.prefetch,
                ..TransportConfig::default()
            },
        }
    }

    fn open_store(&self) -> anyhow::Result<Arc<dyn StateStore>> {
        match self.store {
            StoreKind::Memory => Ok(Arc::new(MemoryStateStore::new())),
            #[cfg(feature = "redb")]
            StoreKind::Redb => {
                let store = simplebus_runtime::storage::RedbStateStore::open(&self.store_path)
                    .with_context(|| format!("opening {}", self.store_path.display()))?;
                Ok(Arc::new(store))
            }
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    if let Some(addr) = args.metrics_addr {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("installing prometheus exporter")?;
        info!(%addr, "metrics exporter listening");
    }

    let work = WorkDelay(Duration::from_millis(args.work_ms));
    let host = BusBuilder::new(args.bus_config())
        .store(args.open_store()?)
        .configure(|registry| samples::register_all(registry, work))?
        .start()
        .await?;

    let bus = host.bus();
    bus.send(&publish_agent::PublishAgent { id: Uuid::new_v4() })
        .await?;
    bus.send(&import_evaluator::ImportEvaluatorData {
        import_id: Uuid::new_v4(),
    })
    .await?;
    bus.send(&train_models::TrainModels { id: Uuid::new_v4() })
        .await?;

    tokio::select! {
        idle = host.wait_idle(Duration::from_secs(300)) => {
            info!(idle, in_flight = host.in_flight_count(), "sample workflows settled, press Ctrl-C to exit");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for Ctrl-C")?;
        }
    }

    info!("shutting down");
    let drained = host.shutdown().await?;
    info!(drained, "sample worker stopped");
    Ok(())
}
