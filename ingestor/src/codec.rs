use crate::errors::{DecodeError, Result};
use crate::model::{format_timestamp, DeviceId, Reading, DEFAULT_DEVICE_TYPE, DEFAULT_LOCATION};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// Decodes the bytes of a single receive into a reading.
pub fn decode(payload: &[u8]) -> std::result::Result<Reading, DecodeError> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Err(DecodeError::Empty);
    }

    // Structural parse
    let value: Value =
        serde_json::from_slice(payload).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let mut object = match value {
        Value::Object(object) => object,
        other => {
            return Err(DecodeError::Malformed(format!(
                "expected a JSON object, got {}",
                json_type_name(&other)
            )))
        }
    };

    let device_id = match object.remove("device_id") {
        None | Some(Value::Null) => return Err(DecodeError::MissingDeviceId),
        Some(Value::String(id)) => DeviceId::new(id).ok_or(DecodeError::MissingDeviceId)?,
        Some(other) => {
            return Err(DecodeError::InvalidField {
                field: "device_id".to_string(),
                reason: format!("expected a string, got {}", json_type_name(&other)),
            })
        }
    };

    Ok(Reading {
        device_id,
        device_type: take_string(&mut object, "device_type")?
            .unwrap_or_else(|| DEFAULT_DEVICE_TYPE.to_string()),
        location: take_string(&mut object, "location")?
            .unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
        temperature: take_f64(&mut object, "temperature")?,
        humidity: take_f64(&mut object, "humidity")?,
        light_level: take_i64(&mut object, "light_level")?,
        voltage: take_f64(&mut object, "voltage")?,
        timestamp: take_string(&mut object, "timestamp")?,
    })
}

fn invalid(field: &str, expected: &str, got: &Value) -> DecodeError {
    DecodeError::InvalidField {
        field: field.to_string(),
        reason: format!("expected {}, got {}", expected, json_type_name(got)),
    }
}

fn take_string(
    object: &mut Map<String, Value>,
    field: &str,
) -> std::result::Result<Option<String>, DecodeError> {
    match object.remove(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(invalid(field, "a string", &other)),
    }
}

fn take_f64(
    object: &mut Map<String, Value>,
    field: &str,
) -> std::result::Result<Option<f64>, DecodeError> {
    match object.remove(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_f64()
            .map(Some)
            .ok_or_else(|| invalid(field, "a number", &value)),
    }
}

fn take_i64(
    object: &mut Map<String, Value>,
    field: &str,
) -> std::result::Result<Option<i64>, DecodeError> {
    match object.remove(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_i64()
            .map(Some)
            .ok_or_else(|| invalid(field, "an integer", &value)),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(n) if n.is_f64() => "a fractional number",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// Response sent back to the device before the connection closes.
#[derive(Debug, Clone)]
pub struct Acknowledgement {
    pub status: Status,
    pub message: String,
    extra: Map<String, Value>,
}

impl Acknowledgement {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: Status::Success,
            message: message.into(),
            extra: Map::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            message: message.into(),
            extra: Map::new(),
        }
    }

    /// Adds a top-level field. Extra fields win over the fixed ones on collision.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        self.encode_at(Utc::now())
    }

    pub fn encode_at(&self, now: DateTime<Utc>) -> Result<Vec<u8>> {
        let mut body = Map::new();
        body.insert("status".to_string(), serde_json::to_value(self.status)?);
        body.insert("message".to_string(), Value::String(self.message.clone()));
        body.insert("timestamp".to_string(), Value::String(format_timestamp(now)));
        body.extend(self.extra.clone());

        Ok(serde_json::to_vec(&Value::Object(body))?)
    }
}
