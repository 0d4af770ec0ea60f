//! Broker sessions.
//!
//! The `ConnectionSupervisor` builds two independent sessions from the same
//! read-only settings: a subscriber that feeds raw messages into the ingest
//! channel, and a publisher session handed to the `CommandPublisher`. Each keeps
//! its own `ConnectionState` and reconnects with bounded exponential backoff
//! until shutdown is requested.

use crate::config::{BrokerConfig, ReconnectConfig};
use crate::errors::Result;
use crate::ingest::InboundMessage;
use crate::metrics::{MESSAGES_TOTAL, RECONNECT_ATTEMPTS_TOTAL};
use crate::publisher::MqttPublishSession;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, TlsConfiguration,
    Transport,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const REQUEST_CHANNEL_CAPACITY: usize = 64;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Exponential reconnect delay, doubling from `min` up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(bounds: ReconnectConfig) -> Self {
        Self {
            min: bounds.min_delay,
            max: bounds.max_delay,
            current: bounds.min_delay,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

/// Connection options shared by both sessions: credentials, keep-alive and TLS.
pub fn mqtt_options(broker: &BrokerConfig, client_id: &str) -> Result<MqttOptions> {
    let mut options = MqttOptions::new(client_id, broker.host.clone(), broker.port);
    options.set_credentials(broker.username.clone(), broker.password.clone());
    options.set_keep_alive(broker.keep_alive);
    options.set_clean_session(true);

    if broker.tls {
        let transport = match &broker.ca_path {
            Some(path) => {
                let ca = std::fs::read(path)?;
                Transport::tls_with_config(TlsConfiguration::Simple {
                    ca,
                    alpn: None,
                    client_auth: None,
                })
            }
            None => Transport::tls_with_default_config(),
        };
        options.set_transport(transport);
    }

    Ok(options)
}

fn client_id(role: &str) -> String {
    format!("relay-{}-{}", role, uuid::Uuid::new_v4().simple())
}

/// Owns the broker settings and hands out the two sessions.
#[derive(Debug, Clone)]
pub struct ConnectionSupervisor {
    broker: BrokerConfig,
    reconnect: ReconnectConfig,
    publish_timeout: Duration,
}

impl ConnectionSupervisor {
    pub fn new(broker: BrokerConfig, reconnect: ReconnectConfig, publish_timeout: Duration) -> Self {
        Self {
            broker,
            reconnect,
            publish_timeout,
        }
    }

    pub fn subscriber(&self, filters: Vec<String>) -> Result<SubscriberSession> {
        let options = mqtt_options(&self.broker, &client_id("sub"))?;
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        Ok(SubscriberSession {
            client,
            eventloop,
            filters,
            state: ConnectionState::Disconnected,
            backoff: Backoff::new(self.reconnect),
        })
    }

    pub fn publisher(&self) -> Result<MqttPublishSession> {
        let options = mqtt_options(&self.broker, &client_id("pub"))?;
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        Ok(MqttPublishSession::new(
            client,
            eventloop,
            Backoff::new(self.reconnect),
            self.publish_timeout,
        ))
    }
}

pub struct SubscriberSession {
    client: AsyncClient,
    eventloop: EventLoop,
    filters: Vec<String>,
    state: ConnectionState,
    backoff: Backoff,
}

impl SubscriberSession {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Drives the session until shutdown, forwarding every publish to `tx`.
    pub async fn run(mut self, tx: mpsc::Sender<InboundMessage>, shutdown: CancellationToken) {
        self.state = ConnectionState::Connecting;
        info!(filters = ?self.filters, "Starting subscriber session");

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    self.state = ConnectionState::Connected;
                    self.backoff.reset();
                    info!("Subscriber connected");
                    self.subscribe_all();
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    MESSAGES_TOTAL.inc();
                    debug!(
                        "Received message on topic {}, size: {} bytes",
                        publish.topic,
                        publish.payload.len()
                    );
                    let message = InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    };
                    if !forward(&tx, message, &shutdown).await {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    self.state = ConnectionState::Disconnected;
                    RECONNECT_ATTEMPTS_TOTAL
                        .with_label_values(&["subscriber"])
                        .inc();
                    let delay = self.backoff.next_delay();
                    warn!("Subscriber disconnected: {}. Reconnecting in {:?}", e, delay);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    self.state = ConnectionState::Connecting;
                }
            }
        }

        self.close().await;
    }

    fn subscribe_all(&self) {
        for filter in &self.filters {
            match self.client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                Ok(()) => info!("Subscribed to {} with QoS 1", filter),
                Err(e) => error!("Failed to subscribe to {}: {}", filter, e),
            }
        }
    }

    async fn close(&mut self) {
        if self.state == ConnectionState::Connected {
            for filter in &self.filters {
                if let Err(e) = self.client.try_unsubscribe(filter.as_str()) {
                    warn!("Failed to unsubscribe from {}: {}", filter, e);
                }
            }
            if let Err(e) = self.client.try_disconnect() {
                warn!("Failed to request disconnect: {}", e);
            }
            drain_until_disconnect(&mut self.eventloop).await;
        }
        self.state = ConnectionState::Disconnected;
        info!("Subscriber session closed");
    }
}

/// Hands a message to the ingest channel, waiting for room unless shutdown
/// comes first. Returns false when the subscriber should stop.
async fn forward(
    tx: &mpsc::Sender<InboundMessage>,
    message: InboundMessage,
    shutdown: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => {
            warn!("Shutdown while ingest channel full, dropping pending message");
            false
        }
        sent = tx.send(message) => {
            if sent.is_err() {
                error!("Ingest channel closed, stopping subscriber");
            }
            sent.is_ok()
        }
    }
}

/// Polls until the disconnect packet has been written or the link drops.
pub(crate) async fn drain_until_disconnect(eventloop: &mut EventLoop) {
    let drain = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };
    if tokio::time::timeout(CLOSE_TIMEOUT, drain).await.is_err() {
        warn!("Timed out waiting for broker disconnect");
    }
}
