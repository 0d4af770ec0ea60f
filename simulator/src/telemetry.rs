use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// DHT11 reading as the firmware publishes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorPayload {
    pub temp: f64,
    pub hum: f64,
    pub timestamp: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairing_token: Option<String>,
}

impl SensorPayload {
    pub fn random(rng: &mut impl Rng, now: DateTime<Utc>, pairing_token: Option<String>) -> Self {
        let temp = if rng.gen_bool(0.05) {
            rng.gen_range(-50.0..100.0) // 5% outliers
        } else {
            rng.gen_range(22.0..34.0)
        };
        let hum = if rng.gen_bool(0.05) {
            rng.gen_range(0.0..100.0)
        } else {
            rng.gen_range(40.0..90.0)
        };

        Self {
            temp: round_tenth(temp),
            hum: round_tenth(hum),
            timestamp: now.format(TIMESTAMP_FORMAT).to_string(),
            status: "online".to_string(),
            pairing_token,
        }
    }
}

/// Last-will and heartbeat body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairing_token: Option<String>,
}

impl StatusPayload {
    pub fn new(status: &str, pairing_token: Option<String>) -> Self {
        Self {
            status: status.to_string(),
            pairing_token,
        }
    }
}

fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
