mod telemetry;

use clap::Parser;
use rand::Rng;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS, Transport};
use std::collections::HashMap;
use std::time::Duration;
use telemetry::{SensorPayload, StatusPayload};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Impersonates a fleet of ESP32 DHT11 sensors.
#[derive(Debug, Clone, Parser)]
#[command(name = "simulator")]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    #[arg(long, env = "MQTT_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "MQTT_PASSWORD")]
    password: Option<String>,

    #[arg(long, env = "MQTT_TLS")]
    tls: bool,

    /// Number of simulated devices, named `<prefix>-00`, `<prefix>-01`, ...
    #[arg(long, env = "DEVICES", default_value_t = 3)]
    devices: usize,

    #[arg(long, env = "DEVICE_PREFIX", default_value = "esp32")]
    device_prefix: String,

    /// Seconds between readings per device.
    #[arg(long, env = "INTERVAL_SECS", default_value_t = 5)]
    interval: u64,

    #[arg(long, env = "TELEMETRY_NAMESPACE", default_value = "iot")]
    telemetry_namespace: String,

    #[arg(long, env = "TELEMETRY_SUFFIX", default_value = "dht11")]
    telemetry_suffix: String,

    #[arg(long, env = "STATUS_NAMESPACE", default_value = "hydrosee")]
    status_namespace: String,

    #[arg(long, env = "MQTT_COMMAND_TOPIC", default_value = "serangga/deteksi")]
    command_topic: String,

    /// Per-device pairing tokens as `device=token`, comma separated, for relays
    /// that verify tokens on the transport. Devices without an entry send none.
    #[arg(
        long = "pairing-token",
        env = "PAIRING_TOKENS",
        value_delimiter = ',',
        value_parser = parse_pairing
    )]
    pairing_tokens: Vec<(String, String)>,
}

impl Args {
    fn device_ids(&self) -> Vec<String> {
        (0..self.devices)
            .map(|index| format!("{}-{:02}", self.device_prefix, index))
            .collect()
    }

    fn token_map(&self) -> HashMap<String, String> {
        self.pairing_tokens.iter().cloned().collect()
    }
}

fn parse_pairing(raw: &str) -> Result<(String, String), String> {
    let (device_id, token) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected device=token, got {:?}", raw))?;
    let (device_id, token) = (device_id.trim(), token.trim());
    if device_id.is_empty() || token.is_empty() {
        return Err(format!("expected device=token, got {:?}", raw));
    }
    Ok((device_id.to_string(), token.to_string()))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    info!("Starting device simulator");
    info!(
        "Broker: {}:{}, Devices: {}, Interval: {}s",
        args.broker, args.port, args.devices, args.interval
    );

    let device_ids = args.device_ids();
    let mut tokens = args.token_map();
    let mut handles = Vec::with_capacity(device_ids.len());
    for device_id in device_ids {
        let token = tokens.remove(&device_id);
        handles.push(tokio::spawn(run_device(args.clone(), device_id, token)));
    }
    for device_id in tokens.keys() {
        warn!("Pairing token given for {} which is not simulated", device_id);
    }

    tokio::select! {
        _ = join_devices(handles) => warn!("All devices stopped"),
        _ = tokio::signal::ctrl_c() => info!("Received shutdown signal"),
    }
}

async fn join_devices(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            error!("Device task failed: {}", e);
        }
    }
}

async fn run_device(args: Args, device_id: String, pairing_token: Option<String>) {
    let telemetry_topic = format!(
        "{}/{}/{}",
        args.telemetry_namespace, device_id, args.telemetry_suffix
    );
    let status_topic = format!("{}/status/{}/lwt", args.status_namespace, device_id);

    let will = match serde_json::to_vec(&StatusPayload::new("offline", pairing_token.clone())) {
        Ok(payload) => payload,
        Err(e) => {
            error!("Failed to encode last will: {}", e);
            return;
        }
    };

    let client_id = format!("sim-{}-{}", device_id, uuid::Uuid::new_v4().simple());
    let mut mqtt_options = MqttOptions::new(client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);
    mqtt_options.set_last_will(LastWill::new(&status_topic, will, QoS::AtLeastOnce, false));
    if let (Some(username), Some(password)) = (&args.username, &args.password) {
        mqtt_options.set_credentials(username, password);
    }
    if args.tls {
        mqtt_options.set_transport(Transport::tls_with_default_config());
    }

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);

    // Announce on every (re)connect and print incoming detection commands
    let announcer = client.clone();
    let command_topic = args.command_topic.clone();
    let announce_topic = status_topic.clone();
    let id = device_id.clone();
    let online = StatusPayload::new("online", pairing_token.clone());
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(device_id = %id, "Connected");
                    if let Err(e) = announcer.try_subscribe(&command_topic, QoS::AtLeastOnce) {
                        warn!(device_id = %id, "Failed to subscribe to commands: {}", e);
                    }
                    match serde_json::to_vec(&online) {
                        Ok(payload) => {
                            if let Err(e) =
                                announcer.try_publish(&announce_topic, QoS::AtLeastOnce, false, payload)
                            {
                                warn!(device_id = %id, "Failed to announce online: {}", e);
                            }
                        }
                        Err(e) => error!("Failed to encode status: {}", e),
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    info!(
                        device_id = %id,
                        "Command on {}: {}",
                        publish.topic,
                        String::from_utf8_lossy(&publish.payload)
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    error!(device_id = %id, "MQTT eventloop error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval.max(1)));
    let mut counter = 0u64;

    loop {
        ticker.tick().await;

        let payload = {
            let mut rng = rand::thread_rng();
            // Occasionally send a broken reading to exercise the relay's validation
            if rng.gen_bool(0.01) {
                b"{\"temp\": \"n/a\"}".to_vec()
            } else {
                let reading =
                    SensorPayload::random(&mut rng, chrono::Utc::now(), pairing_token.clone());
                match serde_json::to_vec(&reading) {
                    Ok(p) => p,
                    Err(e) => {
                        error!("Failed to serialize telemetry: {}", e);
                        continue;
                    }
                }
            }
        };

        match client
            .publish(&telemetry_topic, QoS::AtLeastOnce, false, payload)
            .await
        {
            Ok(_) => {
                counter += 1;
                if counter % 100 == 0 {
                    info!(device_id = %device_id, "Published {} readings", counter);
                }
            }
            Err(e) => warn!(device_id = %device_id, "Failed to publish: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairing_tokens_per_device() {
        let args = Args::try_parse_from([
            "simulator",
            "--devices",
            "2",
            "--pairing-token",
            "esp32-00=aaa, esp32-01=bbb",
        ])
        .unwrap();

        assert_eq!(args.device_ids(), vec!["esp32-00", "esp32-01"]);
        let tokens = args.token_map();
        assert_eq!(tokens.get("esp32-00").map(String::as_str), Some("aaa"));
        assert_eq!(tokens.get("esp32-01").map(String::as_str), Some("bbb"));
    }

    #[test]
    fn test_pairing_token_requires_device() {
        assert!(parse_pairing("aaa").is_err());
        assert!(parse_pairing("=aaa").is_err());
        assert!(parse_pairing("esp32-00=").is_err());
        assert!(Args::try_parse_from(["simulator", "--pairing-token", "aaa"]).is_err());
    }
}
