use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use slotq::config::Config;
use slotq::engine::Engine;
use slotq::notify::{LogSink, NotifyHub, run_dispatcher};
use slotq::reaper;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    slotq::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let (hub, outbox) = NotifyHub::with_outbox();
    let engine = Arc::new(
        Engine::new(config.wal_path(), Arc::new(hub))?
            .with_average_service_minutes(config.average_service_minutes),
    );

    let dispatcher = tokio::spawn(run_dispatcher(outbox, Arc::new(LogSink)));
    let reaper_task = tokio::spawn(reaper::run_reaper(engine.clone(), config.reaper_interval));
    let compactor_task = tokio::spawn(reaper::run_compactor(
        engine.clone(),
        config.compact_threshold,
        config.reaper_interval,
    ));

    info!("slotq running");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  average_service_minutes: {}", config.average_service_minutes);
    info!("  compact_threshold: {}", config.compact_threshold);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

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
    info!("shutdown signal received");

    reaper_task.abort();
    compactor_task.abort();
    let _ = reaper_task.await;
    let _ = compactor_task.await;

    // Leave a compact log behind so the next start replays quickly.
    if let Err(e) = engine.compact_wal().await {
        tracing::warn!("final compaction failed: {e}");
    }

    // Dropping the engine drops the hub and closes the outbox, letting the dispatcher drain.
    drop(engine);
    let drain = tokio::time::timeout(std::time::Duration::from_secs(5), dispatcher).await;
    if drain.is_err() {
        tracing::warn!("notification drain timed out");
    }

    info!("slotq stopped");
    Ok(())
}
