use color_eyre::{eyre::eyre, Result};
use mqtt_bridge::bridge::{Bridge, BridgeOptions};
use mqtt_bridge::config::{BridgeConfig, StorageBackend};
use mqtt_bridge::mqtt::rumqtt_transport::RumqttTransport;
use mqtt_bridge::persistence::memory_store::MemoryStore;
use mqtt_bridge::persistence::sled_store::SledStore;
use mqtt_bridge::persistence::MessageStore;
use mqtt_bridge::publisher::Publisher;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = BridgeConfig::load_with_env(config_path.as_deref())?;
    let settings = config.validate().map_err(|e| {
        error!("Configuration error: {}", e);
        eyre!("Invalid configuration. Check logs for details.")
    })?;
    info!(broker = %settings.address(), client_id = %settings.client_id, "Configuration loaded");

    let options = BridgeOptions::from_config(&config);
    let store = if options.handler.needs_store() {
        Some(open_store(&config)?)
    } else {
        None
    };

    let transport = Arc::new(RumqttTransport::new());
    let bridge = Bridge::start(transport, store, options)?;

    if let Err(e) = bridge.connect(&settings).await {
        error!("Failed to connect to MQTT broker: {}", e);
        bridge.shutdown().await;
        return Err(eyre!("Failed to connect to MQTT broker: {}", e));
    }

    if let Err(e) = bridge.subscribe_all(&config.handler.subscriptions) {
        warn!("Subscribing failed: {}", e);
    }

    let publisher = config.publisher.is_enabled().then(|| {
        Publisher::new(bridge.client().clone(), &config.publisher, &settings.client_id).spawn()
    });

    info!("Bridge running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    if let Some(publisher) = publisher {
        let sent = publisher.stop().await;
        info!(sent, "Publisher finished");
    }

    let report = bridge.shutdown().await;
    info!(
        drained = report.drained,
        drain_failed = report.failed,
        processed = report.stats.processed,
        dropped = report.stats.dropped,
        failed = report.stats.failed,
        "Shutdown complete"
    );
    Ok(())
}

fn open_store(config: &BridgeConfig) -> Result<Arc<dyn MessageStore>> {
    match config.storage.backend {
        StorageBackend::Sled => {
            let path = config.storage.resolved_path();
            let store = SledStore::open(&path)
                .map_err(|e| eyre!("Failed to open message store at {}: {}", path.display(), e))?;
            Ok(Arc::new(store))
        }
        StorageBackend::Memory => {
            warn!("Using in-memory message store, messages are lost on exit");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;

    match dotenvy::dotenv() {
        Ok(path) => setup_logging_env(Some(path)),
        Err(e) if e.not_found() => setup_logging_env(None),
        Err(e) => {
            setup_logging_env(None);
            warn!("Failed to load .env file: {}", e);
        }
    }
    Ok(())
}

fn setup_logging_env(dotenv: Option<PathBuf>) {
    let filter = EnvFilter::try_from_env("BRIDGE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    if let Some(path) = dotenv {
        info!("Loaded environment from {}", path.display());
    }
}
