use crate::errors::Error;
use crate::identity::{bearer_token, IdentityVerifier};
use crate::model::{DetectionStatus, Device, DeviceStatus, DeviceType, Reading};
use crate::publisher::CommandSender;
use crate::registry::{DeviceRegistry, RegisterRequest};
use crate::store::{NewReading, ReadingStore};
use crate::validate::{coerce_f64, validate_humidity, validate_temperature};
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<DeviceRegistry>,
    pub readings: Arc<dyn ReadingStore>,
    pub identity: Arc<dyn IdentityVerifier>,
    pub commands: CommandSender,
}

pub fn create_router(state: AppState) -> Router {
    let devices = Router::new()
        .route("/register", post(register_device))
        .route("/sensor-update", post(sensor_update))
        .route("/status", post(status_heartbeat))
        .route("/list", get(list_devices))
        .route("/history/:device_id", get(device_history))
        .route("/rename/:device_id", put(rename_device))
        .route("/:device_id", delete(delete_device));

    Router::new()
        .nest("/api/iot_device", devices)
        .route("/api/detection/command", post(queue_command))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterBody {
    #[serde(alias = "idToken")]
    identity_token: String,
    device_id: String,
    device_name: Option<String>,
    device_type: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterResponse {
    success: bool,
    device_id: String,
    created: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pairing_token: Option<String>,
}

async fn register_device(
    State(state): State<AppState>,
    body: Result<Json<RegisterBody>, JsonRejection>,
) -> Result<Json<RegisterResponse>, AppError> {
    let Json(body) = body?;
    let owner_id = state.identity.verify(&body.identity_token).await?;
    let device_type = match body.device_type.as_deref() {
        Some(raw) => raw.parse::<DeviceType>()?,
        None => DeviceType::default(),
    };

    let registration = state
        .registry
        .register(RegisterRequest {
            device_id: body.device_id,
            owner_id,
            device_type,
            name: body.device_name,
        })
        .await?;

    Ok(Json(RegisterResponse {
        success: true,
        created: registration.created(),
        device_id: registration.device.id,
        pairing_token: registration.pairing_token,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SensorUpdateBody {
    device_id: String,
    temp: Value,
    #[serde(alias = "humid")]
    hum: Value,
    pairing_token: String,
}

async fn sensor_update(
    State(state): State<AppState>,
    body: Result<Json<SensorUpdateBody>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let Json(body) = body?;
    state
        .registry
        .authenticate_device(&body.device_id, &body.pairing_token)
        .await?;

    let temperature = coerce_f64(&body.temp)
        .ok_or_else(|| Error::Validation("temp must be a number".to_string()))
        .and_then(validate_temperature)?;
    let humidity = coerce_f64(&body.hum)
        .ok_or_else(|| Error::Validation("hum must be a number".to_string()))
        .and_then(validate_humidity)?;

    state
        .registry
        .apply_telemetry(&body.device_id, temperature, humidity, DeviceStatus::Online)
        .await?;

    let timestamp = state.registry.server_time().await?;
    if let Err(e) = state
        .readings
        .append(
            &body.device_id,
            NewReading {
                temperature,
                humidity,
                timestamp,
            },
        )
        .await
    {
        error!(device_id = %body.device_id, "Failed to append reading: {}", e);
    }

    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody {
    device_id: String,
    pairing_token: String,
    status: String,
}

async fn status_heartbeat(
    State(state): State<AppState>,
    body: Result<Json<StatusBody>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let Json(body) = body?;
    state
        .registry
        .authenticate_device(&body.device_id, &body.pairing_token)
        .await?;

    let status = DeviceStatus::parse(&body.status);
    state.registry.set_status(&body.device_id, status).await?;

    Ok(Json(json!({ "success": true, "status": status })))
}

#[derive(Debug, Serialize)]
struct DeviceList {
    success: bool,
    devices: Vec<Device>,
    count: usize,
}

async fn list_devices(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<DeviceList>, AppError> {
    let caller = caller(&state, &headers).await?;
    let devices = state.registry.list_by_owner(&caller).await?;
    Ok(Json(DeviceList {
        success: true,
        count: devices.len(),
        devices,
    }))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryResponse {
    success: bool,
    device_id: String,
    readings: Vec<Reading>,
    count: usize,
}

async fn device_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(device_id): Path<String>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Json<HistoryResponse>, AppError> {
    let Query(query) = query?;
    let caller = caller(&state, &headers).await?;
    state.registry.owned_device(&device_id, &caller).await?;

    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let readings = state.readings.recent(&device_id, limit).await?;

    Ok(Json(HistoryResponse {
        success: true,
        count: readings.len(),
        device_id,
        readings,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenameBody {
    #[serde(alias = "name")]
    new_name: String,
}

async fn rename_device(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(device_id): Path<String>,
    body: Result<Json<RenameBody>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let Json(body) = body?;
    let caller = caller(&state, &headers).await?;
    let name = state
        .registry
        .rename(&device_id, &caller, &body.new_name)
        .await?;
    Ok(Json(json!({ "success": true, "deviceId": device_id, "name": name })))
}

async fn delete_device(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(device_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let caller = caller(&state, &headers).await?;
    state.registry.delete(&device_id, &caller).await?;
    Ok(Json(json!({ "success": true, "deviceId": device_id })))
}

#[derive(Debug, Deserialize)]
struct CommandBody {
    status: DetectionStatus,
}

async fn queue_command(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<CommandBody>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let Json(body) = body?;
    let caller = caller(&state, &headers).await?;
    state.commands.try_send(body.status)?;
    info!(caller = %caller, status = body.status.as_str(), "Detection command queued");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "success": true, "status": body.status })),
    ))
}

async fn caller(state: &AppState, headers: &HeaderMap) -> Result<String, Error> {
    let token = bearer_token(headers)?;
    state.identity.verify(token).await
}

pub struct AppError(Error);

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self(Error::Validation(rejection.body_text()))
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        Self(Error::Validation(rejection.body_text()))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self.0 {
            Error::OwnershipConflict { owner, .. } => (
                StatusCode::FORBIDDEN,
                json!({ "error": "Device already registered to another user", "owner": owner }),
            ),
            Error::Validation(detail) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "Invalid request", "detail": detail }),
            ),
            Error::Json(e) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "Invalid request", "detail": e.to_string() }),
            ),
            Error::Unauthenticated(detail) => (
                StatusCode::UNAUTHORIZED,
                json!({ "error": "Unauthorized", "detail": detail }),
            ),
            Error::Unauthorized(detail) => (
                StatusCode::FORBIDDEN,
                json!({ "error": "Forbidden", "detail": detail }),
            ),
            Error::DeviceNotFound(device_id) => (
                StatusCode::NOT_FOUND,
                json!({ "error": "Device not found", "detail": device_id }),
            ),
            Error::IdentityProvider(detail) => {
                warn!("Identity provider error: {}", detail);
                (
                    StatusCode::BAD_GATEWAY,
                    json!({ "error": "Identity provider unavailable" }),
                )
            }
            Error::ChannelSend => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": "Command queue unavailable" }),
            ),
            other => {
                error!("API error: {}", other);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Internal server error" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}
