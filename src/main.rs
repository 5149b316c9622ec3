use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use evrent::config::Config;
use evrent::engine::Engine;
use evrent::station::InMemoryStations;
use evrent::sweeper;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    evrent::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let wal_path = config.data_dir.join("reservations.wal");

    let stations = Arc::new(InMemoryStations::new());
    let engine = Arc::new(Engine::new(wal_path.clone(), stations, config.policy.clone())?);

    info!("evrentd started");
    info!("  wal: {}", wal_path.display());
    info!("  sweep every {:?}, compact every {:?} (threshold {})", config.sweep_interval, config.compact_interval, config.compact_threshold);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let sweeper_task = tokio::spawn(sweeper::run_sweeper(engine.clone(), config.sweep_interval));
    let compactor_task = tokio::spawn(sweeper::run_compactor(
        engine.clone(),
        config.compact_threshold,
        config.compact_interval,
    ));

    // Every commit is fsynced before it is acknowledged, so stopping only
    // means not starting new background passes.
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }

    info!("shutdown signal received");
    sweeper_task.abort();
    compactor_task.abort();

    if let Err(e) = engine.compact_wal().await {
        warn!("final compaction failed: {e}");
    }
    info!("evrentd stopped");
    Ok(())
}
