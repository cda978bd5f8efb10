use crate::config_store::{DeviceRoute, RuntimeConfig};
use crate::models::TelemetryMessage;
use thiserror::Error;
use tracing::{debug, warn};

/// Payload schemas this process knows how to decode. Anything else falls
/// through as an opaque pass-through.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaTag {
    DefaultEngine,
    Unrecognized,
}

impl From<&str> for SchemaTag {
    fn from(tag: &str) -> Self {
        match tag {
            "DefaultEngine" => SchemaTag::DefaultEngine,
            _ => SchemaTag::Unrecognized,
        }
    }
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no route configured for topic '{0}'")]
    UnknownTopic(String),
    #[error("payload did not match the expected schema: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Outcome of classifying one inbound message: the owning route, the decoded
/// body when the schema allowed it, the normalized bytes to forward
/// upstream, and whether an alert is due.
#[derive(Debug)]
pub struct Classification {
    pub route: DeviceRoute,
    pub decoded: Option<TelemetryMessage>,
    pub forward: Vec<u8>,
    pub alert: bool,
}

fn sentinel_payload(raw: &[u8]) -> Vec<u8> {
    let mut buf = b"unknown format: ".to_vec();
    buf.extend_from_slice(raw);
    buf
}

/// Map an inbound message to its route and decide what to do with it.
///
/// Unknown topics are an error and the message is dropped by the caller. A
/// recognized schema that fails to decode is logged and forwarded with a
/// sentinel marker instead of being dropped; an unrecognized schema skips
/// decoding and alerting and is forwarded unchanged.
pub fn classify(
    config: &RuntimeConfig,
    topic: &str,
    payload: &[u8],
) -> Result<Classification, RouteError> {
    let route = config
        .routes
        .iter()
        .find(|r| r.data_topic == topic)
        .cloned()
        .ok_or_else(|| RouteError::UnknownTopic(topic.to_string()))?;

    match SchemaTag::from(route.schema.as_str()) {
        SchemaTag::DefaultEngine => match serde_json::from_slice::<TelemetryMessage>(payload) {
            Ok(message) => {
                let alert = message.machine.temperature >= config.alert_threshold as f64;
                let forward = match serde_json::to_vec(&message) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("could not re-serialize telemetry from '{}': {e}", topic);
                        sentinel_payload(payload)
                    }
                };
                Ok(Classification {
                    route,
                    decoded: Some(message),
                    forward,
                    alert,
                })
            }
            Err(e) => {
                let error = RouteError::Decode(e);
                warn!("message on '{}': {error}; forwarding with sentinel", topic);
                Ok(Classification {
                    route,
                    decoded: None,
                    forward: sentinel_payload(payload),
                    alert: false,
                })
            }
        },
        SchemaTag::Unrecognized => {
            debug!(
                "schema '{}' on '{}' is not recognized; forwarding raw payload",
                route.schema, topic
            );
            Ok(Classification {
                route,
                decoded: None,
                forward: payload.to_vec(),
                alert: false,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &[u8] = br#"{"machine":{"id":"d1","temperature":30,"pressure":1},"ambient":{"temperature":20,"humidity":40},"timeCreated":"2024-01-01T00:00:00Z"}"#;

    fn config_with(schema: &str, threshold: i64) -> RuntimeConfig {
        RuntimeConfig {
            alert_threshold: threshold,
            broker_address: "127.0.0.1".to_string(),
            broker_port: 8883,
            device_count: 1,
            routes: vec![DeviceRoute {
                id: "d1".to_string(),
                schema: schema.to_string(),
                data_topic: "t/in".to_string(),
                feedback_topic: "t/fb".to_string(),
            }],
        }
    }

    #[test]
    fn unknown_topic_is_an_error() {
        let config = config_with("DefaultEngine", 25);
        let result = classify(&config, "t/elsewhere", PAYLOAD);
        assert!(matches!(result, Err(RouteError::UnknownTopic(_))));
    }

    #[test]
    fn temperature_at_threshold_raises_an_alert() {
        let config = config_with("DefaultEngine", 30);
        let classification = classify(&config, "t/in", PAYLOAD).unwrap();
        assert!(classification.alert);
        assert_eq!(classification.route.feedback_topic, "t/fb");
        assert_eq!(classification.decoded.unwrap().machine.id, "d1");
    }

    #[test]
    fn temperature_below_threshold_does_not_alert() {
        let config = config_with("DefaultEngine", 31);
        let classification = classify(&config, "t/in", PAYLOAD).unwrap();
        assert!(!classification.alert);
        assert!(classification.decoded.is_some());
    }

    #[test]
    fn decoded_messages_forward_normalized_json() {
        let config = config_with("DefaultEngine", 25);
        let classification = classify(&config, "t/in", PAYLOAD).unwrap();
        let round_trip: crate::models::TelemetryMessage =
            serde_json::from_slice(&classification.forward).unwrap();
        assert_eq!(Some(round_trip), classification.decoded);
    }

    #[test]
    fn malformed_payload_is_forwarded_with_sentinel() {
        let config = config_with("DefaultEngine", 25);
        let classification = classify(&config, "t/in", b"not json").unwrap();
        assert!(classification.decoded.is_none());
        assert!(!classification.alert);
        assert_eq!(classification.forward, b"unknown format: not json".to_vec());
    }

    #[test]
    fn unrecognized_schema_forwards_raw_payload() {
        let config = config_with("CustomVendor", 25);
        let classification = classify(&config, "t/in", b"\x01\x02\x03").unwrap();
        assert!(classification.decoded.is_none());
        assert!(!classification.alert);
        assert_eq!(classification.forward, vec![1, 2, 3]);
    }
}
