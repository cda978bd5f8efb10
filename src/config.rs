use dotenvy::dotenv;
use std::env;
use thiserror::Error;
use tracing::warn;

/// TLS parameters for the broker transport. Defaults mirror the usual edge
/// deployment: TLS 1.2 minimum, trust anchor from a local certificate file.
#[derive(Debug, Clone)]
pub struct TlsOptions {
    pub min_version: String,
    pub trust_anchor_path: String,
    pub allow_untrusted_leaf: bool,
    pub ignore_chain_errors: bool,
    pub ignore_revocation_errors: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_client_id: String,
    pub mqtt_max_retries: i32,
    pub mqtt_retry_interval_ms: u64,
    pub mqtt_tls: Option<TlsOptions>,

    pub alert_threshold: i64,
    pub upstream_url: String,
    pub upstream_channel: String,
    pub config_document_path: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

fn env_bool(key: &str, default: bool) -> Result<bool, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<bool>()
            .map_err(|_| ConfigError::ParsingError(format!("{} must be true or false", key))),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Validate timeout values and other critical configurations.
    fn validate_timeouts(&self) -> Result<(), ConfigError> {
        const MIN_TIMEOUT: u64 = 100;
        const MAX_TIMEOUT: u64 = 1_000_000;

        if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&self.mqtt_retry_interval_ms) {
            return Err(ConfigError::ParsingError(format!(
                "MQTT_RETRY_INTERVAL_MS must be between {} and {} ms",
                MIN_TIMEOUT, MAX_TIMEOUT
            )));
        }

        Ok(())
    }

    fn load_tls_options() -> Result<Option<TlsOptions>, ConfigError> {
        if !env_bool("MQTT_TLS_ENABLED", false)? {
            return Ok(None);
        }

        let options = TlsOptions {
            min_version: env::var("MQTT_TLS_MIN_VERSION").unwrap_or_else(|_| "1.2".to_string()),
            trust_anchor_path: env::var("MQTT_TLS_CA_PATH")
                .unwrap_or_else(|_| "certs/ca.crt".to_string()),
            allow_untrusted_leaf: env_bool("MQTT_TLS_ALLOW_UNTRUSTED", true)?,
            ignore_chain_errors: env_bool("MQTT_TLS_IGNORE_CHAIN_ERRORS", false)?,
            ignore_revocation_errors: env_bool("MQTT_TLS_IGNORE_REVOCATION_ERRORS", false)?,
        };

        if !matches!(options.min_version.as_str(), "1.2" | "1.3") {
            return Err(ConfigError::ParsingError(
                "MQTT_TLS_MIN_VERSION must be 1.2 or 1.3".to_string(),
            ));
        }

        // The rustls-backed transport always verifies the full chain; these
        // switches exist for configuration parity with older deployments.
        if options.allow_untrusted_leaf {
            warn!("MQTT_TLS_ALLOW_UNTRUSTED is set; the transport still verifies the leaf certificate");
        }
        if options.ignore_chain_errors || options.ignore_revocation_errors {
            warn!("TLS chain/revocation errors cannot be ignored by the transport; flags have no effect");
        }

        Ok(Some(options))
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file

        let config = Self {
            mqtt_host: env::var("MQTT_HOST")
                .map_err(|_| ConfigError::MissingOrInvalid("MQTT_HOST".to_string()))?,
            mqtt_port: env::var("MQTT_PORT")
                .map_err(|_| ConfigError::MissingOrInvalid("MQTT_PORT".to_string()))?
                .parse::<u16>()
                .map_err(|_| ConfigError::ParsingError("MQTT_PORT must be a valid number".to_string()))?,
            mqtt_client_id: env::var("MQTT_CLIENT_ID").unwrap_or_else(|_| "edge-relay".to_string()),
            mqtt_max_retries: env::var("MQTT_MAX_RETRIES")
                .unwrap_or_else(|_| "-1".to_string())
                .parse::<i32>()
                .map_err(|_| ConfigError::ParsingError("MQTT_MAX_RETRIES must be an integer".to_string()))?,
            mqtt_retry_interval_ms: env::var("MQTT_RETRY_INTERVAL_MS")
                .unwrap_or_else(|_| "5000".to_string())
                .parse::<u64>()
                .map_err(|_| {
                    ConfigError::ParsingError("MQTT_RETRY_INTERVAL_MS must be a valid number".to_string())
                })?,
            mqtt_tls: Self::load_tls_options()?,

            alert_threshold: env::var("ALERT_THRESHOLD")
                .unwrap_or_else(|_| "25".to_string())
                .parse::<i64>()
                .map_err(|_| ConfigError::ParsingError("ALERT_THRESHOLD must be an integer".to_string()))?,
            upstream_url: env::var("UPSTREAM_URL")
                .map_err(|_| ConfigError::MissingOrInvalid("UPSTREAM_URL".to_string()))?,
            upstream_channel: env::var("UPSTREAM_CHANNEL").unwrap_or_else(|_| "output1".to_string()),
            config_document_path: env::var("CONFIG_DOCUMENT").ok(),
        };

        config.validate_timeouts()?;

        Ok(config)
    }
}
