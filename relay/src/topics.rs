//! Topic classification for inbound transport messages.
//!
//! Two shapes are recognized:
//!
//! ```text
//! <telemetry namespace>/<device id>/<telemetry suffix>    e.g. iot/esp32-01/dht11
//! <status namespace>/status/<device id>/lwt              e.g. hydrosee/status/esp32-01/lwt
//! ```
//!
//! Everything else is `Route::Unrecognized`.

const DELIMITER: char = '/';
const STATUS_SEGMENT: &str = "status";
const LAST_WILL_SUFFIX: &str = "lwt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    SensorTelemetry { device_id: String },
    Liveness { device_id: String },
    Unrecognized,
}

impl Route {
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Route::SensorTelemetry { device_id } | Route::Liveness { device_id } => Some(device_id),
            Route::Unrecognized => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRouter {
    telemetry_namespace: String,
    telemetry_suffix: String,
    status_namespace: String,
}

impl Default for TopicRouter {
    fn default() -> Self {
        Self::new("iot", "dht11", "hydrosee")
    }
}

impl TopicRouter {
    pub fn new(
        telemetry_namespace: impl Into<String>,
        telemetry_suffix: impl Into<String>,
        status_namespace: impl Into<String>,
    ) -> Self {
        Self {
            telemetry_namespace: telemetry_namespace.into(),
            telemetry_suffix: telemetry_suffix.into(),
            status_namespace: status_namespace.into(),
        }
    }

    /// Subscription filters covering every shape `classify` accepts.
    pub fn subscriptions(&self) -> Vec<String> {
        vec![
            format!("{}/+/{}", self.telemetry_namespace, self.telemetry_suffix),
            format!("{}/{}/+/{}", self.status_namespace, STATUS_SEGMENT, LAST_WILL_SUFFIX),
        ]
    }

    pub fn telemetry_topic(&self, device_id: &str) -> String {
        format!("{}/{}/{}", self.telemetry_namespace, device_id, self.telemetry_suffix)
    }

    pub fn last_will_topic(&self, device_id: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.status_namespace, STATUS_SEGMENT, device_id, LAST_WILL_SUFFIX
        )
    }

    pub fn classify(&self, topic: &str) -> Route {
        let segments: Vec<&str> = topic.split(DELIMITER).collect();

        match segments.as_slice() {
            [namespace, device_id, suffix]
                if *namespace == self.telemetry_namespace
                    && *suffix == self.telemetry_suffix
                    && is_device_segment(device_id) =>
            {
                Route::SensorTelemetry {
                    device_id: device_id.to_string(),
                }
            }
            [namespace, status, device_id, suffix]
                if *namespace == self.status_namespace
                    && *status == STATUS_SEGMENT
                    && *suffix == LAST_WILL_SUFFIX
                    && is_device_segment(device_id) =>
            {
                Route::Liveness {
                    device_id: device_id.to_string(),
                }
            }
            _ => Route::Unrecognized,
        }
    }
}

fn is_device_segment(segment: &str) -> bool {
    !segment.is_empty() && !segment.contains(['+', '#'])
}
