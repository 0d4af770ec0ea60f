#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use relay::errors::{Error, Result};
use relay::identity::IdentityVerifier;
use relay::model::{DetectionStatus, DeviceType};
use relay::publisher::command_channel;
use relay::registry::{DeviceRegistry, RegisterRequest};
use relay::rest::{create_router, AppState};
use relay::store::MemoryStore;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower::util::ServiceExt;

/// Accepts `token-<uid>` and rejects everything else.
pub struct StaticIdentity;

#[async_trait]
impl IdentityVerifier for StaticIdentity {
    async fn verify(&self, id_token: &str) -> Result<String> {
        id_token
            .strip_prefix("token-")
            .filter(|uid| !uid.is_empty())
            .map(str::to_string)
            .ok_or_else(|| Error::Unauthenticated("Invalid token".to_string()))
    }
}

pub struct TestApp {
    pub router: Router,
    pub store: Arc<MemoryStore>,
    pub registry: Arc<DeviceRegistry>,
    pub commands: mpsc::Receiver<DetectionStatus>,
}

pub fn test_app(command_capacity: usize) -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(DeviceRegistry::new(store.clone()));
    let (sender, commands) = command_channel(command_capacity);
    let router = create_router(AppState {
        registry: registry.clone(),
        readings: store.clone(),
        identity: Arc::new(StaticIdentity),
        commands: sender,
    });
    TestApp {
        router,
        store,
        registry,
        commands,
    }
}

impl TestApp {
    pub async fn call(&self, request: Request<Body>) -> (StatusCode, Value) {
        let resp = self.router.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    /// Registers a sensor directly through the registry and returns its token.
    pub async fn paired_sensor(&self, device_id: &str, owner: &str) -> String {
        self.paired_device(device_id, owner, DeviceType::Sensor).await
    }

    pub async fn paired_device(&self, device_id: &str, owner: &str, device_type: DeviceType) -> String {
        self.registry
            .register(RegisterRequest {
                device_id: device_id.to_string(),
                owner_id: owner.to_string(),
                device_type,
                name: None,
            })
            .await
            .unwrap()
            .pairing_token
            .unwrap()
    }
}

pub fn json_request(method: &str, uri: &str, bearer: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = bearer {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub fn empty_request(method: &str, uri: &str, bearer: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = bearer {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    builder.body(Body::empty()).unwrap()
}
