// src/main.rs
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

use ami_monitor::ami::AmiClient;
use ami_monitor::config::Config;
use ami_monitor::monitor::{
    ExtensionSynchronizer, LogChangeSink, MemoryStatusStore, StaticProvider, StatusQuerier,
    StatusStore,
};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .init();

    info!("🚀 Starting AMI extension monitor");

    let config = Config::from_env().expect("Failed to load configuration");
    info!("Environment: {}", config.environment);

    if config.monitor.extensions.is_empty() {
        error!("MONITOR_EXTENSIONS is empty; nothing to monitor");
        return Ok(());
    }

    let client = AmiClient::new(config.ami.clone());
    client.start().await.expect("Failed to connect to AMI");
    info!("✅ Connected and authenticated to AMI");

    let provider = Arc::new(StaticProvider::new(config.monitor.extensions.clone()));
    let store = Arc::new(MemoryStatusStore::new());
    let sink = Arc::new(LogChangeSink);

    let synchronizer = Arc::new(ExtensionSynchronizer::new(
        Arc::clone(&client) as Arc<dyn StatusQuerier>,
        provider,
        Arc::clone(&store) as Arc<dyn StatusStore>,
        sink,
        config.monitor.clone(),
    ));

    // Unsolicited status events trigger an early refresh between polls.
    let live_events = client.subscribe("ExtensionStatus");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sync_task = tokio::spawn(Arc::clone(&synchronizer).run(Some(live_events), shutdown_rx));
    info!("✅ Extension synchronizer started");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    let _ = shutdown_tx.send(true);
    let _ = sync_task.await;
    client.stop().await;

    let stats = synchronizer.stats();
    info!(
        cycles = stats.cycles_completed,
        writes = stats.writes,
        notifications = stats.notifications,
        "Final synchronizer statistics"
    );
    for status in store.snapshot().await {
        info!(
            extension = %status.extension,
            state = ?status.state,
            raw = %status.raw_code,
            "Final extension state"
        );
    }

    Ok(())
}
