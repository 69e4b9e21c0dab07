use std::sync::Arc;

use tracing::info;

use slotbook::clock::SystemClock;
use slotbook::config::Config;
use slotbook::engine::Engine;
use slotbook::identity::MemberRegistry;
use slotbook::jobs;
use slotbook::notify::{LogNotifier, Notifier, OutboxNotifier};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    slotbook::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;

    let registry = match &config.members_file {
        Some(path) => MemberRegistry::load_json(path)?,
        None => MemberRegistry::new(),
    };
    let notifier: Arc<dyn Notifier> = match &config.outbox_file {
        Some(path) => Arc::new(OutboxNotifier::open(path).await?),
        None => Arc::new(LogNotifier),
    };

    let engine = Arc::new(Engine::new(
        config.wal_path(),
        Arc::new(registry),
        notifier.clone(),
        Arc::new(SystemClock),
    )?);

    info!("slotbook started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  providers loaded: {}", engine.provider_count());
    info!(
        "  notifications: {}",
        config
            .outbox_file
            .as_ref()
            .map_or("log".to_string(), |p| p.display().to_string())
    );
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let tasks = [
        tokio::spawn(jobs::run_reminder_job(
            engine.clone(),
            notifier.clone(),
            config.reminder_interval,
        )),
        tokio::spawn(jobs::run_monthly_report_job(engine.clone(), notifier.clone())),
        tokio::spawn(jobs::run_compactor(engine.clone(), config.compact_threshold)),
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

    info!("shutdown signal received, stopping jobs");
    for task in &tasks {
        task.abort();
    }
    if let Err(e) = engine.compact_wal().await {
        tracing::warn!("final compaction failed: {e}");
    }
    info!("slotbook stopped");
    Ok(())
}
