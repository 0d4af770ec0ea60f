use crate::errors::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_DEVICE_NAME: &str = "ESP32-HydroSee";

/// Hardware category of a device, fixed at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Sensor,
    Camera,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Sensor => "sensor",
            DeviceType::Camera => "camera",
        }
    }

    pub fn reports_telemetry(&self) -> bool {
        matches!(self, DeviceType::Sensor)
    }
}

impl FromStr for DeviceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sensor" => Ok(DeviceType::Sensor),
            "camera" => Ok(DeviceType::Camera),
            other => Err(Error::Validation(format!("Unknown device type: {}", other))),
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Liveness state as last reported by the device or its broker last-will.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    #[default]
    Offline,
    Online,
    Unknown,
}

impl DeviceStatus {
    /// Lenient mapping of device-reported strings; anything unexpected is `Unknown`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "online" => DeviceStatus::Online,
            "offline" => DeviceStatus::Offline,
            _ => DeviceStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Offline => "offline",
            DeviceStatus::Online => "online",
            DeviceStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One physical unit, keyed by its hardware identifier (usually the MAC address).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    #[serde(rename = "deviceId")]
    pub id: String,
    pub name: String,
    pub device_type: DeviceType,
    pub owner_id: String,
    #[serde(skip)]
    pub pairing_token_hash: String,
    pub status: DeviceStatus,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_humidity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_count: Option<i64>,
    #[serde(skip)]
    pub version: i64,
}

impl Device {
    /// A freshly paired device with the defaults appropriate for its type.
    pub fn new(
        id: String,
        name: String,
        device_type: DeviceType,
        owner_id: String,
        pairing_token_hash: String,
        now: DateTime<Utc>,
    ) -> Self {
        let telemetry_default = device_type.reports_telemetry().then_some(0.0);
        Self {
            id,
            name,
            device_type,
            owner_id,
            pairing_token_hash,
            status: DeviceStatus::Offline,
            created_at: now,
            last_seen: now,
            last_temperature: telemetry_default,
            last_humidity: telemetry_default,
            image_count: (device_type == DeviceType::Camera).then_some(0),
            version: 0,
        }
    }
}

/// Historical sensor sample, child of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Reading {
    pub temperature: f64,
    pub humidity: f64,
    pub timestamp: DateTime<Utc>,
}

/// Pest-detection verdict forwarded to devices on the command topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionStatus {
    Present,
    Absent,
}

impl DetectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionStatus::Present => "present",
            DetectionStatus::Absent => "absent",
        }
    }
}

/// Wire payload of the outbound command topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub status: DetectionStatus,
}
