//! # Tally Worker
//!
//! Runs the sales processor workers, the reservation expiry sweeper and the
//! reconciler against Redis and the SQLite ledger.
//!
//! ## Startup
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  1. tracing (RUST_LOG, default info)                                    │
//! │  2. TallyConfig: defaults → tally.toml → TALLY_* env                    │
//! │  3. SQLite ledger + migrations                                          │
//! │  4. Redis: reservation store + stream channel (consumer groups)         │
//! │  5. spawn: N processor workers, expiry sweeper, reconciler              │
//! │  6. wait for Ctrl+C / SIGTERM, stop everything gracefully               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use tally_db::{Database, DbConfig, LedgerStore};
use tally_engine::{
    EventChannel, ExpirySweeper, RedisReservationStore, RedisStreamsChannel, Reconciler, ReservationEngine,
    ReservationStore, SalesProcessor, StockQueryService, TallyConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!("Starting Tally worker...");

    let config_path = std::env::var_os("TALLY_CONFIG").map(PathBuf::from);
    let config = TallyConfig::load(config_path).context("loading configuration")?;
    let redis_url = config
        .redis
        .url
        .clone()
        .context("redis.url (or TALLY_REDIS_URL) is required")?;
    info!(
        database = %config.database.path.display(),
        partitions = config.channel.partitions,
        workers = config.processor.workers,
        "Configuration loaded"
    );

    let db = Database::new(
        DbConfig::new(config.database.path.clone()).max_connections(config.database.max_connections),
    )
    .await
    .context("opening ledger database")?;
    let ledger: Arc<dyn LedgerStore> = Arc::new(db);
    info!("Ledger ready");

    let store: Arc<dyn ReservationStore> = Arc::new(
        RedisReservationStore::connect(&redis_url, config.reservation.retention())
            .await
            .context("connecting reservation store")?,
    );
    let channel: Arc<dyn EventChannel> = Arc::new(
        RedisStreamsChannel::connect(&redis_url, &config.channel)
            .await
            .context("connecting event channel")?,
    );
    info!("Connected to Redis");

    let engine = Arc::new(ReservationEngine::new(
        store,
        Arc::clone(&ledger),
        Arc::clone(&channel),
        config.reservation.clone(),
    ));
    let query = Arc::new(StockQueryService::new(
        Arc::clone(&ledger),
        Arc::clone(&channel),
        Arc::clone(&engine),
    ));
    let processor = Arc::new(SalesProcessor::new(
        Arc::clone(&ledger),
        Arc::clone(&channel),
        Arc::clone(&engine),
        config.processor.clone(),
        config.channel.clone(),
    ));

    let workers = processor.spawn_workers(config.processor.workers);

    let (sweeper, sweeper_handle) = ExpirySweeper::new(Arc::clone(&engine));
    let sweeper_task = tokio::spawn(sweeper.run());

    let (reconciler, reconciler_handle) = Reconciler::new(
        Arc::clone(&ledger),
        Arc::clone(&engine),
        query,
        config.processor.reconcile_interval(),
    );
    let reconciler_task = tokio::spawn(reconciler.run());

    shutdown_signal().await;

    workers.shutdown().await;
    if let Err(e) = sweeper_handle.shutdown().await {
        error!(error = %e, "Failed to stop expiry sweeper");
    }
    if let Err(e) = reconciler_handle.shutdown().await {
        error!(error = %e, "Failed to stop reconciler");
    }
    let _ = tokio::join!(sweeper_task, reconciler_task);

    info!("Worker shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown...");
}
