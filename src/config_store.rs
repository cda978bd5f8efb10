use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

/// Binding between one device and its topics, rebuilt wholesale on every
/// configuration update. `data_topic` is the routing key and must identify
/// at most one route in the table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceRoute {
    pub id: String,
    pub schema: String,
    pub data_topic: String,
    pub feedback_topic: String,
}

/// Immutable configuration snapshot. Replaced as a unit on each update and
/// handed out behind an `Arc`; readers mid-cycle keep whatever snapshot they
/// started with.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub alert_threshold: i64,
    pub broker_address: String,
    pub broker_port: u16,
    pub device_count: usize,
    pub routes: Vec<DeviceRoute>,
}

/// Owns the current [`RuntimeConfig`] and folds remotely-supplied documents
/// into it. Documents are flat string maps; keys that are absent keep their
/// previous value, keys that fail to parse are logged and skipped.
pub struct ConfigStore {
    current: Arc<RuntimeConfig>,
}

/// Upper bound on `deviceCount`. The table is allocated up front, so an
/// absurd remotely-pushed count must be rejected like any other bad value
/// instead of being handed to the allocator.
const MAX_DEVICE_COUNT: usize = 1024;

fn apply_parsed<T: FromStr>(fields: &HashMap<String, String>, key: &str, slot: &mut T) {
    if let Some(raw) = fields.get(key) {
        match raw.parse::<T>() {
            Ok(value) => *slot = value,
            Err(_) => warn!("ignoring '{}': value '{}' does not parse", key, raw),
        }
    }
}

fn apply_string(fields: &HashMap<String, String>, key: &str, slot: &mut String) {
    if let Some(raw) = fields.get(key) {
        *slot = raw.clone();
    }
}

impl ConfigStore {
    pub fn new(initial: RuntimeConfig) -> Self {
        Self {
            current: Arc::new(initial),
        }
    }

    /// Fold a configuration document into the current snapshot and return
    /// the replacement. The device table is rebuilt from index 1 to
    /// `deviceCount` on every call; each index is seeded from the previous
    /// table so a document that omits a device's keys leaves it unchanged.
    pub fn apply(&mut self, fields: &HashMap<String, String>) -> Arc<RuntimeConfig> {
        let previous = self.current.clone();
        let mut next = (*previous).clone();

        apply_parsed(fields, "alertThreshold", &mut next.alert_threshold);
        apply_string(fields, "brokerAddress", &mut next.broker_address);
        apply_parsed(fields, "brokerPort", &mut next.broker_port);
        if let Some(raw) = fields.get("deviceCount") {
            match raw.parse::<usize>() {
                Ok(count) if count <= MAX_DEVICE_COUNT => next.device_count = count,
                Ok(count) => warn!(
                    "ignoring 'deviceCount': {} exceeds the {} device limit",
                    count, MAX_DEVICE_COUNT
                ),
                Err(_) => warn!("ignoring 'deviceCount': value '{}' does not parse", raw),
            }
        }

        let mut routes = Vec::with_capacity(next.device_count);
        for i in 1..=next.device_count {
            let mut route = previous.routes.get(i - 1).cloned().unwrap_or_default();
            apply_string(fields, &format!("Device{}_ID", i), &mut route.id);
            apply_string(fields, &format!("Device{}_Schema", i), &mut route.schema);
            apply_string(fields, &format!("Device{}_DataTopic", i), &mut route.data_topic);
            apply_string(
                fields,
                &format!("Device{}_FeedbackTopic", i),
                &mut route.feedback_topic,
            );
            info!("device route configured: '{}' <- '{}'", route.id, route.data_topic);
            routes.push(route);
        }
        next.routes = routes;

        self.current = Arc::new(next);
        self.current.clone()
    }
}
