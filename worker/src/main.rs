//! Checkout worker process.
//!
//! Publishes the transactional outbox and expires abandoned payments until
//! interrupted.

use checkout_core::environment::{Clock, SystemClock};
use checkout_core::store::UnitOfWork;
use checkout_engine::{PaymentCleanupJob, PaymentService};
use checkout_postgres::PostgresStore;
use checkout_runtime::metrics::MetricsServer;
use checkout_runtime::{OutboxDispatcher, PeriodicJob, PeriodicWorker};
use checkout_worker::{LogFormat, WorkerConfig, wiring};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is normal outside local development
    dotenvy::dotenv().ok();

    let config = WorkerConfig::from_env()?;
    init_tracing(&config);

    info!(
        gateway = %config.payments.gateway,
        batch_size = config.outbox.batch_size,
        "Starting checkout worker"
    );

    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout))
        .idle_timeout(Duration::from_secs(config.database.idle_timeout))
        .connect(&config.database.url)
        .await?;
    let store = PostgresStore::from_pool(pool);
    store.migrate().await?;
    info!("Database ready");

    let mut metrics = MetricsServer::new(config.metrics_addr()?);
    metrics.start()?;
    info!(address = %config.metrics_addr()?, "Metrics server started");

    let uow: Arc<dyn UnitOfWork> = Arc::new(store);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let gateways = wiring::build_gateways(&config)?;
    let payments = PaymentService::new(
        Arc::clone(&uow),
        Arc::clone(&clock),
        gateways,
        config.checkout_settings(),
    );

    let subscribers = wiring::build_subscribers(&config)?;
    if subscribers.is_empty() {
        warn!("No subscribers configured; outbox messages will be marked processed unread");
    }
    let outbox_settings = config.outbox_settings();
    let poll_interval = outbox_settings.poll_interval;
    let dispatcher = subscribers.into_iter().fold(
        OutboxDispatcher::new(Arc::clone(&uow), Arc::clone(&clock), outbox_settings),
        OutboxDispatcher::with_subscriber,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let jobs: [(Arc<dyn PeriodicJob>, Duration); 2] = [
        (Arc::new(dispatcher), poll_interval),
        (
            Arc::new(PaymentCleanupJob::new(payments)),
            Duration::from_secs(config.payments.cleanup_interval_secs),
        ),
    ];
    let handles: Vec<_> = jobs
        .into_iter()
        .map(|(job, interval)| PeriodicWorker::new(job, interval, shutdown_rx.clone()).spawn())
        .collect();
    info!(workers = handles.len(), "Workers started");

    shutdown_signal().await;
    info!("Shutdown requested, waiting for workers");
    let _ = shutdown_tx.send(true);

    let grace = Duration::from_secs(config.server.shutdown_timeout);
    if tokio::time::timeout(grace, futures::future::join_all(handles))
        .await
        .is_err()
    {
        warn!(timeout_secs = grace.as_secs(), "Workers did not stop in time");
    }

    info!("Checkout worker stopped");
    Ok(())
}

fn init_tracing(config: &WorkerConfig) {
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.server.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn shutdown_signal() {
    if let Err(error) = signal::ctrl_c().await {
        warn!(%error, "Failed to listen for Ctrl+C; shutting down");
    }
}
