use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_DEVICE_TYPE: &str = "sensor_module";
pub const DEFAULT_LOCATION: &str = "unknown";

/// Identifier of a sensor device. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    /// Returns `None` for an empty or whitespace-only identifier.
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            None
        } else {
            Some(Self(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DeviceId {
    type Error = &'static str;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        DeviceId::new(value).ok_or("device_id cannot be empty")
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A decoded sensor reading that has not been persisted yet
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub device_id: DeviceId,
    pub device_type: String,
    pub location: String,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub light_level: Option<i64>,
    pub voltage: Option<f64>,
    /// Producer-supplied timestamp, kept verbatim.
    pub timestamp: Option<String>,
}

impl Reading {
    /// A reading carrying only a device identifier, all other fields defaulted.
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            device_type: DEFAULT_DEVICE_TYPE.to_string(),
            location: DEFAULT_LOCATION.to_string(),
            temperature: None,
            humidity: None,
            light_level: None,
            voltage: None,
            timestamp: None,
        }
    }
}

/// A reading as it sits in the log
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StoredReading {
    pub id: i64,
    pub device_id: String,
    pub device_type: String,
    pub location: String,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub light_level: Option<i64>,
    pub voltage: Option<f64>,
    pub timestamp: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Per-device rollup row
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DeviceRecord {
    pub device_id: String,
    pub device_type: String,
    pub location: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub total_records: i64,
}

/// Aggregate over the reading log for one device
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DeviceStatistics {
    pub device_id: String,
    pub record_count: i64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub avg_temperature: Option<f64>,
    pub avg_humidity: Option<f64>,
    pub avg_light_level: Option<f64>,
}

/// What a successful persist produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    pub id: i64,
    pub received_at: DateTime<Utc>,
}

/// REST API response wrapper
#[derive(Debug, Serialize)]
pub struct ReadingsResponse {
    pub data: Vec<StoredReading>,
    pub count: usize,
    pub limit: u32,
}

/// Fixed-width RFC 3339 form used for every stored timestamp, so that
/// string comparison in SQL matches chronological order.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}
