//! Inbound message handling.
//!
//! The subscriber session pushes raw `(topic, payload)` pairs into a channel;
//! `run_ingest` drains it on its own task, one message at a time, in delivery
//! order. Nothing in here returns an error to the transport side: every failure
//! is logged, counted and turned into a `Dropped` outcome.

use crate::errors::Error;
use crate::metrics::{
    DROPPED_MESSAGES_TOTAL, INGEST_LATENCY_SECONDS, LIVENESS_UPDATES_TOTAL, STORE_FAILURES_TOTAL,
    TELEMETRY_APPLIED_TOTAL,
};
use crate::registry::DeviceRegistry;
use crate::store::{NewReading, ReadingStore};
use crate::topics::{Route, TopicRouter};
use crate::validate::{self, Payload};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    UnrecognizedTopic,
    InvalidPayload,
    Unauthenticated,
    UnknownDevice,
    StoreFailure,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Malformed => "malformed",
            DropReason::UnrecognizedTopic => "unrecognized_topic",
            DropReason::InvalidPayload => "invalid_payload",
            DropReason::Unauthenticated => "unauthenticated",
            DropReason::UnknownDevice => "unknown_device",
            DropReason::StoreFailure => "store_failure",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    TelemetryApplied,
    StatusUpdated,
    Dropped(DropReason),
}

pub struct TelemetryIngestor {
    router: TopicRouter,
    registry: Arc<DeviceRegistry>,
    readings: Arc<dyn ReadingStore>,
    require_pairing_token: bool,
}

impl TelemetryIngestor {
    pub fn new(
        router: TopicRouter,
        registry: Arc<DeviceRegistry>,
        readings: Arc<dyn ReadingStore>,
    ) -> Self {
        Self {
            router,
            registry,
            readings,
            require_pairing_token: false,
        }
    }

    /// When set, every payload must carry a `pairingToken` matching the device.
    pub fn require_pairing_token(mut self, required: bool) -> Self {
        self.require_pairing_token = required;
        self
    }

    pub async fn handle(&self, topic: &str, raw: &[u8]) -> Outcome {
        let start = Instant::now();
        let outcome = self.process(topic, raw).await;
        INGEST_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());

        match outcome {
            Outcome::TelemetryApplied => TELEMETRY_APPLIED_TOTAL.inc(),
            Outcome::StatusUpdated => LIVENESS_UPDATES_TOTAL.inc(),
            Outcome::Dropped(reason) => DROPPED_MESSAGES_TOTAL
                .with_label_values(&[reason.as_str()])
                .inc(),
        }
        outcome
    }

    async fn process(&self, topic: &str, raw: &[u8]) -> Outcome {
        let payload = match validate::decode(raw) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Dropping malformed payload on {}: {}", topic, e);
                return Outcome::Dropped(DropReason::Malformed);
            }
        };

        match self.router.classify(topic) {
            Route::SensorTelemetry { device_id } => self.handle_sensor(&device_id, &payload).await,
            Route::Liveness { device_id } => self.handle_liveness(&device_id, &payload).await,
            Route::Unrecognized => {
                warn!("Unknown topic structure: {}", topic);
                Outcome::Dropped(DropReason::UnrecognizedTopic)
            }
        }
    }

    async fn handle_sensor(&self, device_id: &str, payload: &Payload) -> Outcome {
        let sample = match validate::sensor_sample(payload) {
            Ok(sample) => sample,
            Err(e) => {
                warn!("Invalid payload from {}: {}", device_id, e);
                return Outcome::Dropped(DropReason::InvalidPayload);
            }
        };
        if let Some(reason) = self.check_pairing(device_id, payload).await {
            return Outcome::Dropped(reason);
        }

        if let Err(e) = self
            .registry
            .apply_telemetry(device_id, sample.temperature, sample.humidity, sample.status)
            .await
        {
            return self.drop_on_error(device_id, e);
        }

        let reading = NewReading {
            temperature: sample.temperature,
            humidity: sample.humidity,
            timestamp: sample.recorded_at,
        };
        if let Err(e) = self.readings.append(device_id, reading).await {
            // the device record is already current; only the history entry is lost
            STORE_FAILURES_TOTAL.inc();
            error!("Failed to append reading for {}: {}", device_id, e);
        }

        debug!(
            "Device {} - temp: {}, hum: {}, status: {}",
            device_id, sample.temperature, sample.humidity, sample.status
        );
        Outcome::TelemetryApplied
    }

    async fn handle_liveness(&self, device_id: &str, payload: &Payload) -> Outcome {
        let status = match validate::liveness_status(payload) {
            Ok(status) => status,
            Err(e) => {
                warn!(
                    "Last-will for {} carries no usable status (would be unknown), dropping: {}",
                    device_id, e
                );
                return Outcome::Dropped(DropReason::InvalidPayload);
            }
        };
        if let Some(reason) = self.check_pairing(device_id, payload).await {
            return Outcome::Dropped(reason);
        }

        match self.registry.set_status(device_id, status).await {
            Ok(()) => {
                info!("Device {} status updated to: {}", device_id, status);
                Outcome::StatusUpdated
            }
            Err(e) => self.drop_on_error(device_id, e),
        }
    }

    async fn check_pairing(&self, device_id: &str, payload: &Payload) -> Option<DropReason> {
        if !self.require_pairing_token {
            return None;
        }
        let Some(token) = payload.get("pairingToken").and_then(|v| v.as_str()) else {
            warn!("Payload from {} has no pairing token, dropping", device_id);
            return Some(DropReason::Unauthenticated);
        };
        match self.registry.authenticate_device(device_id, token).await {
            Ok(_) => None,
            Err(Error::Unauthenticated(_)) => Some(DropReason::Unauthenticated),
            Err(e) => match self.drop_on_error(device_id, e) {
                Outcome::Dropped(reason) => Some(reason),
                _ => Some(DropReason::StoreFailure),
            },
        }
    }

    fn drop_on_error(&self, device_id: &str, err: Error) -> Outcome {
        match err {
            Error::DeviceNotFound(_) => {
                warn!("Device {} not registered, dropping message", device_id);
                Outcome::Dropped(DropReason::UnknownDevice)
            }
            Error::Validation(detail) => {
                warn!("Invalid payload from {}: {}", device_id, detail);
                Outcome::Dropped(DropReason::InvalidPayload)
            }
            e => {
                STORE_FAILURES_TOTAL.inc();
                if e.is_transient() {
                    warn!("Store unavailable while handling {}: {}", device_id, e);
                } else {
                    error!("Store error while handling {}: {}", device_id, e);
                }
                Outcome::Dropped(DropReason::StoreFailure)
            }
        }
    }
}

/// Drains the inbound channel until every sender is gone.
pub async fn run_ingest(mut rx: mpsc::Receiver<InboundMessage>, ingestor: Arc<TelemetryIngestor>) {
    info!("Starting ingest loop");

    while let Some(message) = rx.recv().await {
        let outcome = ingestor.handle(&message.topic, &message.payload).await;
        debug!("Message on {} -> {:?}", message.topic, outcome);
    }

    info!("Ingest loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceStatus, DeviceType};
    use crate::registry::RegisterRequest;
    use crate::store::MemoryStore;
    use serde_json::json;

    async fn setup() -> (TelemetryIngestor, Arc<DeviceRegistry>, Arc<MemoryStore>, String) {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(DeviceRegistry::new(store.clone()));
        let registration = registry
            .register(RegisterRequest {
                device_id: "esp32-01".to_string(),
                owner_id: "uid-a".to_string(),
                device_type: DeviceType::Sensor,
                name: None,
            })
            .await
            .unwrap();
        let ingestor = TelemetryIngestor::new(TopicRouter::default(), registry.clone(), store.clone());
        (ingestor, registry, store, registration.pairing_token.unwrap())
    }

    fn telemetry(temp: f64, hum: f64) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "temp": temp,
            "hum": hum,
            "timestamp": "2025-11-14 08:30:15",
            "status": "online"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_lwt_marks_offline() {
        let (ingestor, registry, _, _) = setup().await;
        registry.set_status("esp32-01", DeviceStatus::Online).await.unwrap();

        let outcome = ingestor
            .handle("hydrosee/status/esp32-01/lwt", br#"{"status": "offline"}"#)
            .await;
        assert_eq!(outcome, Outcome::StatusUpdated);

        let device = registry.get("esp32-01").await.unwrap().unwrap();
        assert_eq!(device.status, DeviceStatus::Offline);
    }

    #[tokio::test]
    async fn test_lwt_without_status_is_dropped() {
        let (ingestor, registry, _, _) = setup().await;
        let before = registry.get("esp32-01").await.unwrap().unwrap();

        let outcome = ingestor.handle("hydrosee/status/esp32-01/lwt", b"{}").await;
        assert_eq!(outcome, Outcome::Dropped(DropReason::InvalidPayload));
        assert_eq!(registry.get("esp32-01").await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn test_unknown_device_is_consumed() {
        let (ingestor, _, store, _) = setup().await;
        let outcome = ingestor.handle("iot/ghost/dht11", &telemetry(25.0, 60.0)).await;
        assert_eq!(outcome, Outcome::Dropped(DropReason::UnknownDevice));
        assert_eq!(store.reading_count("ghost").await, 0);
    }

    #[tokio::test]
    async fn test_unrecognized_topic() {
        let (ingestor, _, _, _) = setup().await;
        let outcome = ingestor.handle("foo/bar", &telemetry(25.0, 60.0)).await;
        assert_eq!(outcome, Outcome::Dropped(DropReason::UnrecognizedTopic));
    }

    #[tokio::test]
    async fn test_pairing_required_on_transport() {
        let (ingestor, registry, _, token) = setup().await;
        let ingestor = ingestor.require_pairing_token(true);

        let outcome = ingestor.handle("iot/esp32-01/dht11", &telemetry(25.0, 60.0)).await;
        assert_eq!(outcome, Outcome::Dropped(DropReason::Unauthenticated));

        let forged = serde_json::to_vec(&json!({
            "temp": 31.0, "hum": 40.0, "timestamp": "2025-11-14 08:30:15",
            "status": "online", "pairingToken": "forged"
        }))
        .unwrap();
        let outcome = ingestor.handle("iot/esp32-01/dht11", &forged).await;
        assert_eq!(outcome, Outcome::Dropped(DropReason::Unauthenticated));

        let signed = serde_json::to_vec(&json!({
            "temp": 31.0, "hum": 40.0, "timestamp": "2025-11-14 08:30:15",
            "status": "online", "pairingToken": token
        }))
        .unwrap();
        let outcome = ingestor.handle("iot/esp32-01/dht11", &signed).await;
        assert_eq!(outcome, Outcome::TelemetryApplied);
        let device = registry.get("esp32-01").await.unwrap().unwrap();
        assert_eq!(device.last_temperature, Some(31.0));
    }

    #[tokio::test]
    async fn test_camera_telemetry_is_dropped() {
        let (ingestor, registry, store, _) = setup().await;
        registry
            .register(RegisterRequest {
                device_id: "cam-01".to_string(),
                owner_id: "uid-a".to_string(),
                device_type: DeviceType::Camera,
                name: None,
            })
            .await
            .unwrap();
        let before = registry.get("cam-01").await.unwrap().unwrap();

        let outcome = ingestor.handle("iot/cam-01/dht11", &telemetry(25.0, 60.0)).await;
        assert_eq!(outcome, Outcome::Dropped(DropReason::InvalidPayload));

        let device = registry.get("cam-01").await.unwrap().unwrap();
        assert_eq!(device, before);
        assert_eq!(device.last_temperature, None);
        assert_eq!(device.last_humidity, None);
        assert_eq!(store.reading_count("cam-01").await, 0);
    }

    #[tokio::test]
    async fn test_run_ingest_drains_channel() {
        let (ingestor, registry, _, _) = setup().await;
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(run_ingest(rx, Arc::new(ingestor)));

        tx.send(InboundMessage {
            topic: "iot/esp32-01/dht11".to_string(),
            payload: telemetry(22.0, 70.0),
        })
        .await
        .unwrap();
        drop(tx);
        handle.await.unwrap();

        let device = registry.get("esp32-01").await.unwrap().unwrap();
        assert_eq!(device.last_temperature, Some(22.0));
        assert_eq!(device.last_humidity, Some(70.0));
    }
}
