mod common;

use axum::http::StatusCode;
use common::{empty_request, json_request, test_app};
use relay::model::{DetectionStatus, DeviceStatus, DeviceType};
use relay::pairing;
use serde_json::json;

#[tokio::test]
async fn register_issues_token_once() {
    let app = test_app(4);
    let body = json!({
        "identityToken": "token-alice",
        "deviceId": "esp32-01",
        "deviceName": "Greenhouse A"
    });

    let (status, v) = app
        .call(json_request("POST", "/api/iot_device/register", None, body.clone()))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["success"], true);
    assert_eq!(v["deviceId"], "esp32-01");
    assert_eq!(v["created"], true);
    let token = v["pairingToken"].as_str().unwrap().to_string();
    assert_eq!(token.len(), 32);

    // Only the hash is stored
    let device = app.registry.get("esp32-01").await.unwrap().unwrap();
    assert_eq!(device.pairing_token_hash, pairing::hash(&token));
    assert_eq!(device.name, "Greenhouse A");
    assert_eq!(device.status, DeviceStatus::Offline);

    let (status, v) = app
        .call(json_request("POST", "/api/iot_device/register", None, body))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["created"], false);
    assert!(v.get("pairingToken").is_none());
    assert_eq!(
        app.registry.get("esp32-01").await.unwrap().unwrap(),
        device
    );
}

#[tokio::test]
async fn register_conflict_reports_owner() {
    let app = test_app(4);
    app.paired_sensor("esp32-01", "alice").await;

    let (status, v) = app
        .call(json_request(
            "POST",
            "/api/iot_device/register",
            None,
            json!({ "idToken": "token-bob", "deviceId": "esp32-01" }),
        ))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(v["owner"], "alice");
    assert!(v["error"].is_string());
}

#[tokio::test]
async fn register_rejections() {
    let app = test_app(4);

    let (status, v) = app
        .call(json_request(
            "POST",
            "/api/iot_device/register",
            None,
            json!({ "identityToken": "garbage", "deviceId": "esp32-01" }),
        ))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(v["error"].is_string());

    let (status, _) = app
        .call(json_request(
            "POST",
            "/api/iot_device/register",
            None,
            json!({ "deviceId": "esp32-01" }),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .call(json_request(
            "POST",
            "/api/iot_device/register",
            None,
            json!({ "identityToken": "token-alice", "deviceId": "esp32-01", "deviceType": "toaster" }),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .call(json_request(
            "POST",
            "/api/iot_device/register",
            None,
            json!({ "identityToken": "token-alice", "deviceId": "iot/+" }),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(app.registry.get("iot/+").await.unwrap().is_none());
}

#[tokio::test]
async fn register_camera_defaults() {
    let app = test_app(4);
    let (status, _) = app
        .call(json_request(
            "POST",
            "/api/iot_device/register",
            None,
            json!({ "identityToken": "token-alice", "deviceId": "cam-01", "deviceType": "camera" }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, v) = app
        .call(empty_request("GET", "/api/iot_device/list", Some("token-alice")))
        .await;
    let device = &v["devices"][0];
    assert_eq!(device["deviceType"], "camera");
    assert_eq!(device["imageCount"], 0);
    assert!(device.get("lastTemperature").is_none());
    assert!(device.get("pairingTokenHash").is_none());
}

#[tokio::test]
async fn sensor_update_requires_pairing_token() {
    let app = test_app(4);
    let token = app.paired_sensor("esp32-01", "alice").await;

    let (status, _) = app
        .call(json_request(
            "POST",
            "/api/iot_device/sensor-update",
            None,
            json!({ "deviceId": "esp32-01", "temp": 25.0, "hum": 60.0, "pairingToken": "wrong" }),
        ))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .call(json_request(
            "POST",
            "/api/iot_device/sensor-update",
            None,
            json!({ "deviceId": "ghost", "temp": 25.0, "hum": 60.0, "pairingToken": token }),
        ))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app
        .call(json_request(
            "POST",
            "/api/iot_device/sensor-update",
            None,
            json!({ "deviceId": "esp32-01", "temp": 25.0, "pairingToken": token }),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let device = app.registry.get("esp32-01").await.unwrap().unwrap();
    assert_eq!(device.last_temperature, Some(0.0));
    assert_eq!(app.store.reading_count("esp32-01").await, 0);
}

#[tokio::test]
async fn sensor_update_rejects_camera() {
    let app = test_app(4);
    let token = app.paired_device("cam-01", "alice", DeviceType::Camera).await;
    let before = app.registry.get("cam-01").await.unwrap().unwrap();

    let (status, v) = app
        .call(json_request(
            "POST",
            "/api/iot_device/sensor-update",
            None,
            json!({ "deviceId": "cam-01", "temp": 25.0, "hum": 60.0, "pairingToken": token }),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(v["error"], "Invalid request");

    let device = app.registry.get("cam-01").await.unwrap().unwrap();
    assert_eq!(device, before);
    assert_eq!(device.last_temperature, None);
    assert_eq!(device.last_humidity, None);
    assert_eq!(app.store.reading_count("cam-01").await, 0);
}

#[tokio::test]
async fn sensor_update_applies_and_records_history() {
    let app = test_app(4);
    let token = app.paired_sensor("esp32-01", "alice").await;

    let (status, v) = app
        .call(json_request(
            "POST",
            "/api/iot_device/sensor-update",
            None,
            json!({ "deviceId": "esp32-01", "temp": "27.5", "humid": 64, "pairingToken": token }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["success"], true);

    let device = app.registry.get("esp32-01").await.unwrap().unwrap();
    assert_eq!(device.last_temperature, Some(27.5));
    assert_eq!(device.last_humidity, Some(64.0));
    assert_eq!(device.status, DeviceStatus::Online);

    let (status, v) = app
        .call(empty_request(
            "GET",
            "/api/iot_device/history/esp32-01",
            Some("token-alice"),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["count"], 1);
    assert_eq!(v["readings"][0]["temperature"], 27.5);
    assert_eq!(v["readings"][0]["humidity"], 64.0);
}

#[tokio::test]
async fn sensor_update_rejects_out_of_range_values() {
    let app = test_app(4);
    let token = app.paired_sensor("esp32-01", "alice").await;

    let (status, v) = app
        .call(json_request(
            "POST",
            "/api/iot_device/sensor-update",
            None,
            json!({ "deviceId": "esp32-01", "temp": 180.0, "hum": 60.0, "pairingToken": token }),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(v["detail"].as_str().unwrap().contains("Temperature"));
}

#[tokio::test]
async fn status_heartbeat() {
    let app = test_app(4);
    let token = app.paired_sensor("esp32-01", "alice").await;

    let (status, v) = app
        .call(json_request(
            "POST",
            "/api/iot_device/status",
            None,
            json!({ "deviceId": "esp32-01", "pairingToken": token, "status": "online" }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["status"], "online");

    let (status, _) = app
        .call(json_request(
            "POST",
            "/api/iot_device/status",
            None,
            json!({ "deviceId": "esp32-01", "pairingToken": "nope", "status": "offline" }),
        ))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let device = app.registry.get("esp32-01").await.unwrap().unwrap();
    assert_eq!(device.status, DeviceStatus::Online);
}

#[tokio::test]
async fn list_is_scoped_to_caller() {
    let app = test_app(4);
    app.paired_sensor("esp32-01", "alice").await;
    app.paired_sensor("esp32-02", "alice").await;
    app.paired_sensor("esp32-03", "bob").await;

    let (status, _) = app
        .call(empty_request("GET", "/api/iot_device/list", None))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, v) = app
        .call(empty_request("GET", "/api/iot_device/list", Some("token-alice")))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["count"], 2);
    for device in v["devices"].as_array().unwrap() {
        assert_eq!(device["ownerId"], "alice");
    }
}

#[tokio::test]
async fn history_checks_ownership_and_limit() {
    let app = test_app(4);
    let token = app.paired_sensor("esp32-01", "alice").await;
    for i in 0..5 {
        let (status, _) = app
            .call(json_request(
                "POST",
                "/api/iot_device/sensor-update",
                None,
                json!({ "deviceId": "esp32-01", "temp": 20.0 + i as f64, "hum": 50.0, "pairingToken": token }),
            ))
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, _) = app
        .call(empty_request(
            "GET",
            "/api/iot_device/history/esp32-01",
            Some("token-bob"),
        ))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .call(empty_request(
            "GET",
            "/api/iot_device/history/ghost",
            Some("token-alice"),
        ))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, v) = app
        .call(empty_request(
            "GET",
            "/api/iot_device/history/esp32-01?limit=2",
            Some("token-alice"),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["count"], 2);
    // Newest first
    assert_eq!(v["readings"][0]["temperature"], 24.0);
    assert_eq!(v["readings"][1]["temperature"], 23.0);

    let (status, _) = app
        .call(empty_request(
            "GET",
            "/api/iot_device/history/esp32-01?limit=lots",
            Some("token-alice"),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn rename_requires_owner() {
    let app = test_app(4);
    app.paired_sensor("esp32-01", "alice").await;

    let (status, _) = app
        .call(json_request(
            "PUT",
            "/api/iot_device/rename/esp32-01",
            Some("token-bob"),
            json!({ "newName": "Mine now" }),
        ))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .call(json_request(
            "PUT",
            "/api/iot_device/rename/esp32-01",
            Some("token-alice"),
            json!({ "newName": "   " }),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, v) = app
        .call(json_request(
            "PUT",
            "/api/iot_device/rename/esp32-01",
            Some("token-alice"),
            json!({ "name": "  Nursery  " }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["name"], "Nursery");
    assert_eq!(
        app.registry.get("esp32-01").await.unwrap().unwrap().name,
        "Nursery"
    );
}

#[tokio::test]
async fn delete_cascades_and_requires_owner() {
    let app = test_app(4);
    let token = app.paired_sensor("esp32-01", "alice").await;
    let (status, _) = app
        .call(json_request(
            "POST",
            "/api/iot_device/sensor-update",
            None,
            json!({ "deviceId": "esp32-01", "temp": 25.0, "hum": 60.0, "pairingToken": token }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app
        .call(empty_request("DELETE", "/api/iot_device/esp32-01", Some("token-bob")))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(app.registry.get("esp32-01").await.unwrap().is_some());

    let (status, v) = app
        .call(empty_request("DELETE", "/api/iot_device/esp32-01", Some("token-alice")))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["deviceId"], "esp32-01");
    assert!(app.registry.get("esp32-01").await.unwrap().is_none());
    assert_eq!(app.store.reading_count("esp32-01").await, 0);

    let (status, _) = app
        .call(empty_request("DELETE", "/api/iot_device/esp32-01", Some("token-alice")))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn detection_command_is_queued() {
    let mut app = test_app(1);

    let (status, _) = app
        .call(json_request(
            "POST",
            "/api/detection/command",
            None,
            json!({ "status": "present" }),
        ))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .call(json_request(
            "POST",
            "/api/detection/command",
            Some("token-classifier"),
            json!({ "status": "maybe" }),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, v) = app
        .call(json_request(
            "POST",
            "/api/detection/command",
            Some("token-classifier"),
            json!({ "status": "present" }),
        ))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(v["status"], "present");

    // Queue holds one command, the next is refused
    let (status, _) = app
        .call(json_request(
            "POST",
            "/api/detection/command",
            Some("token-classifier"),
            json!({ "status": "absent" }),
        ))
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    assert_eq!(app.commands.recv().await, Some(DetectionStatus::Present));
}

#[tokio::test]
async fn malformed_body_is_bad_request() {
    let app = test_app(4);
    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/api/iot_device/register")
        .header("content-type", "application/json")
        .body(axum::body::Body::from("{not json"))
        .unwrap();
    let (status, v) = app.call(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(v["error"].is_string());
    assert!(v["detail"].is_string());
}
