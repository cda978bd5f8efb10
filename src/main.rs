mod config;
mod config_store;
mod forwarder;
mod models;
mod mqtt_service;
mod orchestrator;
mod reconciler;
mod rest_server;
mod router;
mod service_utils;

use crate::config::Config;
use crate::config_store::{ConfigStore, RuntimeConfig};
use crate::forwarder::{ForwardingSink, HttpUpstream};
use crate::mqtt_service::MqttService;
use crate::orchestrator::Orchestrator;
use crate::rest_server::run_rest_server;
use crate::service_utils::{handle_shutdown, load_config_document};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            error!("Error loading configuration: {:?}", e);
            return;
        }
    };

    // The broker address and port start from the environment and are
    // overwritten by remote configuration documents from then on.
    let initial = RuntimeConfig {
        alert_threshold: config.alert_threshold,
        broker_address: config.mqtt_host.clone(),
        broker_port: config.mqtt_port,
        device_count: 0,
        routes: Vec::new(),
    };

    let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(initial.clone()));
    let (config_tx, config_rx) = mpsc::channel(8);
    let (inbound_tx, inbound_rx) = mpsc::channel(64);

    let mqtt_service = MqttService::new(config.clone(), snapshot_rx, inbound_tx);

    // Failing the very first connection aborts startup; there is no useful
    // degraded mode with zero broker access.
    let max_retries = std::cmp::min(
        if config.mqtt_max_retries > 0 {
            config.mqtt_max_retries
        } else {
            5
        },
        100,
    ) as usize;
    let strategy = ExponentialBackoff::from_millis(10)
        .max_delay(Duration::from_millis(config.mqtt_retry_interval_ms))
        .map(jitter)
        .take(max_retries);
    if let Err(e) = Retry::start(strategy, || async { mqtt_service.ensure_connected().await }).await
    {
        error!("Could not establish the initial broker connection: {e}");
        return;
    }

    // Seed the routing table from a local document when one is configured;
    // it flows through the same apply path as remote pushes.
    if let Some(path) = &config.config_document_path {
        match load_config_document(path) {
            Ok(document) => {
                if config_tx.send(document).await.is_err() {
                    error!("Configuration channel closed before startup completed.");
                    return;
                }
            }
            Err(e) => error!("Could not load initial configuration document: {e}"),
        }
    }

    // Start the configuration push endpoint
    tokio::spawn(run_rest_server(config_tx.clone()));

    let store = ConfigStore::new(initial);
    let sink = ForwardingSink::new(
        HttpUpstream::new(config.upstream_url.clone()),
        config.upstream_channel.clone(),
    );
    let orchestrator = Orchestrator::new(store, snapshot_tx, mqtt_service.clone(), sink);

    tokio::select! {
        _ = orchestrator.run(config_rx, inbound_rx) => {}
        _ = handle_shutdown(mqtt_service.clone()) => {}
    }

    info!("EdgeRelay stopped.");
}
