use crate::config::ConfigError;
use crate::mqtt_service::MqttService;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

/// Wait for the termination signal, then tear the broker connection down.
/// In-flight messages are not drained.
pub async fn handle_shutdown(mqtt_service: Arc<MqttService>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to handle termination signal: {:?}", e);
    }
    info!("EdgeRelay is shutting down...");
    mqtt_service.disconnect().await;
}

/// Load the initial configuration document from a local JSON file. The file
/// holds the same flat string map the push endpoint accepts.
pub fn load_config_document(path: &str) -> Result<HashMap<String, String>, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::MissingOrInvalid(format!("{}: {}", path, e)))?;
    serde_json::from_str(&raw)
        .map_err(|e| ConfigError::ParsingError(format!("{} is not a flat string map: {}", path, e)))
}
