//! chvisor daemon
//!
//! Rebuilds host state, recovers orphaned sandboxes, then runs the background
//! loops (TAP pool, memory controller, stats store, metrics) until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use chvisor::config::{MemoryControllerConfig, RunnerConfig, StatsStoreConfig};
use chvisor::memory::{MemoryController, StatsStore};
use chvisor::network::TapPool;
use chvisor::tracing::{init_tracing, shutdown_tracing, LogSettings};
use chvisor::vm::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RunnerConfig::from_env().context("invalid configuration")?;
    init_tracing("chvisor", &LogSettings::from_env())
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        remote = config.is_remote(),
        network_mode = ?config.network_mode,
        "starting chvisor"
    );

    let token = CancellationToken::new();
    let tap_pool_enabled = config.tap_pool_enabled;
    let metrics_addr = config.metrics_addr;

    let client = Arc::new(Client::new(config));
    client
        .initialize()
        .await
        .context("failed to initialize client")?;

    let mut tasks = Vec::new();
    if tap_pool_enabled {
        tasks.push(TapPool::start(Arc::clone(client.tap_pool()), token.clone()));
    }

    match client.recover_orphaned_sandboxes().await {
        Ok(report) if !report.is_clean() => {
            warn!(failed = report.failed.len(), "some sandboxes could not be recovered")
        }
        Ok(_) => {}
        Err(e) => error!(error = %e, "orphan recovery failed"),
    }

    let store = StatsStore::open(StatsStoreConfig::default())
        .await
        .context("failed to open stats store")?;
    store.start(token.clone());

    let controller = Arc::new(MemoryController::new(
        Arc::clone(&client),
        MemoryControllerConfig::default(),
        Some(Arc::clone(&store)),
    ));
    tasks.push(Arc::clone(&controller).start(token.clone()));

    if let Some(addr) = metrics_addr {
        let metrics_token = token.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = chvisor::metrics::serve(addr, metrics_token).await {
                error!(%addr, error = %e, "metrics server failed");
            }
        }));
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");

    token.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "background task panicked");
        }
    }
    if let Err(e) = store.close().await {
        warn!(error = %e, "failed to close stats store");
    }
    client.close().await;

    shutdown_tracing();
    Ok(())
}
