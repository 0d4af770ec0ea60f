use crate::errors::{Error, Result};
use crate::model::DeviceStatus;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};

const TEMP_MIN: f64 = -50.0;
const TEMP_MAX: f64 = 100.0;
const HUMIDITY_MIN: f64 = 0.0;
const HUMIDITY_MAX: f64 = 100.0;

/// Format of the `timestamp` field sent by the devices.
pub const DEVICE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A sensor telemetry payload that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSample {
    pub temperature: f64,
    pub humidity: f64,
    pub recorded_at: DateTime<Utc>,
    pub status: DeviceStatus,
}

pub type Payload = Map<String, Value>;

/// Decodes a raw transport payload into a JSON object.
pub fn decode(raw: &[u8]) -> Result<Payload> {
    match serde_json::from_slice::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::Validation(format!(
            "Payload is not a JSON object: {}",
            type_name(&other)
        ))),
    }
}

/// Numbers, or strings holding a number, as sent by various firmware builds.
pub fn coerce_f64(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

pub fn validate_temperature(temperature: f64) -> Result<f64> {
    if !(TEMP_MIN..=TEMP_MAX).contains(&temperature) {
        return Err(Error::Validation(format!(
            "Temperature {} out of range [{}, {}]",
            temperature, TEMP_MIN, TEMP_MAX
        )));
    }
    Ok(temperature)
}

pub fn validate_humidity(humidity: f64) -> Result<f64> {
    if !(HUMIDITY_MIN..=HUMIDITY_MAX).contains(&humidity) {
        return Err(Error::Validation(format!(
            "Humidity {} out of range [{}, {}]",
            humidity, HUMIDITY_MIN, HUMIDITY_MAX
        )));
    }
    Ok(humidity)
}

/// Validates a sensor telemetry payload: `temp`, `hum`, `timestamp` and `status` are all required.
pub fn sensor_sample(payload: &Payload) -> Result<SensorSample> {
    let temperature = number_field(payload, "temp").and_then(validate_temperature)?;
    let humidity = number_field(payload, "hum").and_then(validate_humidity)?;

    let raw_timestamp = string_field(payload, "timestamp")?;
    let recorded_at = NaiveDateTime::parse_from_str(raw_timestamp.trim(), DEVICE_TIMESTAMP_FORMAT)
        .map_err(|e| Error::Validation(format!("Bad timestamp {:?}: {}", raw_timestamp, e)))?
        .and_utc();

    let status = DeviceStatus::parse(string_field(payload, "status")?);

    Ok(SensorSample {
        temperature,
        humidity,
        recorded_at,
        status,
    })
}

/// Status carried by a last-will or heartbeat message.
pub fn liveness_status(payload: &Payload) -> Result<DeviceStatus> {
    string_field(payload, "status").map(DeviceStatus::parse)
}

fn number_field(payload: &Payload, key: &str) -> Result<f64> {
    let value = payload
        .get(key)
        .ok_or_else(|| Error::Validation(format!("Missing field {}", key)))?;
    coerce_f64(value)
        .ok_or_else(|| Error::Validation(format!("Field {} is not a number: {}", key, value)))
}

fn string_field<'a>(payload: &'a Payload, key: &str) -> Result<&'a str> {
    match payload.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.as_str()),
        Some(other) => Err(Error::Validation(format!(
            "Field {} must be a non-empty string, got {}",
            key, other
        ))),
        None => Err(Error::Validation(format!("Missing field {}", key))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
