use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Telemetry payload as the devices publish it:
/// `{"machine":{...},"ambient":{...},"timeCreated":"..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryMessage {
    pub machine: Machine,
    pub ambient: Ambient,
    #[serde(with = "time::serde::rfc3339")]
    pub time_created: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub id: String,
    pub temperature: f64,
    pub pressure: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ambient {
    pub temperature: f64,
    pub humidity: i64,
}
