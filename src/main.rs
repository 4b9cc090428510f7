use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use parkalloc::batch::BatchAssigner;
use parkalloc::config::Config;
use parkalloc::db::Database;
use parkalloc::engine::AllocationEngine;
use parkalloc::index::IntervalStore;
use parkalloc::notify::NotifyHub;
use parkalloc::{observability, scheduler, time};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let db = Arc::new(Database::open(config.wal_path())?);
    let index = Arc::new(IntervalStore::new());
    let windows = index.load(&db, time::now_ms()).await?;
    let engine = Arc::new(AllocationEngine::new(
        db.clone(),
        index,
        Arc::new(NotifyHub::new()),
    ));
    let assigner = Arc::new(BatchAssigner::new(engine.clone(), config.batch_settings()));

    info!("parkalloc started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  timezone: {}", config.timezone);
    info!("  batch run at: {}", config.batch_run_at);
    info!("  indexed windows: {windows}");
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let tasks = [
        tokio::spawn(scheduler::run_daily_batch(assigner, config.batch_run_at)),
        tokio::spawn(scheduler::run_completion_sweeper(engine, config.sweep_interval)),
        tokio::spawn(scheduler::run_compactor(
            db.clone(),
            config.compact_threshold,
            config.compact_check_interval,
        )),
    ];

    // Graceful shutdown on SIGTERM/ctrl-c
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }

    info!("shutdown signal received, stopping background jobs");
    for task in &tasks {
        task.abort();
    }
    db.shutdown();
    info!("parkalloc stopped");
    Ok(())
}
