//! Outbound pest-detection commands.
//!
//! Commands are queued through a `CommandSender` and published from a
//! dedicated task, so a slow reconnect here never stalls inbound dispatch.

use crate::errors::{Error, Result};
use crate::metrics::{COMMANDS_PUBLISHED_TOTAL, COMMAND_FAILURES_TOTAL, RECONNECT_ATTEMPTS_TOTAL};
use crate::model::{Command, DetectionStatus};
use crate::mqtt::{drain_until_disconnect, Backoff, ConnectionState};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Outgoing, Packet, QoS};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A broker session that can be driven one step at a time.
#[async_trait]
pub trait PublishSession: Send {
    fn state(&self) -> ConnectionState;

    /// One connection attempt, bounded by the session's own timeout.
    async fn reconnect(&mut self) -> Result<()>;

    /// Publishes at QoS 1 and waits for the broker's acknowledgement.
    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Idle work between commands: keep-alive when connected, backed-off
    /// reconnects when not.
    async fn maintain(&mut self) -> Result<()>;

    async fn close(&mut self);
}

/// Pairs broker acknowledgements with the publish that is being waited on.
///
/// The client assigns packet ids when a publish is written, and unacknowledged
/// publishes are written again with their old id after a reconnect. A packet id
/// seen for the first time therefore belongs to the oldest queued publish, and
/// only an ack carrying the id of the latest one completes the wait.
#[derive(Debug, Default)]
struct AckTracker {
    unsent: usize,
    in_flight: HashSet<u16>,
    awaiting: Option<u16>,
}

impl AckTracker {
    /// A publish was handed to the client.
    fn queued(&mut self) {
        self.unsent += 1;
        self.awaiting = None;
    }

    /// Returns true when `event` acknowledges the latest queued publish.
    fn observe(&mut self, event: &Event) -> bool {
        match event {
            Event::Outgoing(Outgoing::Publish(pkid)) => {
                if self.in_flight.insert(*pkid) && self.unsent > 0 {
                    self.unsent -= 1;
                    if self.unsent == 0 {
                        self.awaiting = Some(*pkid);
                    }
                }
                false
            }
            Event::Incoming(Packet::PubAck(ack)) => {
                self.in_flight.remove(&ack.pkid);
                if self.awaiting == Some(ack.pkid) {
                    self.awaiting = None;
                    true
                } else {
                    debug!("Acknowledgement for earlier publish {}", ack.pkid);
                    false
                }
            }
            _ => false,
        }
    }
}

pub struct MqttPublishSession {
    client: AsyncClient,
    eventloop: EventLoop,
    state: ConnectionState,
    backoff: Backoff,
    timeout: Duration,
    acks: AckTracker,
}

impl MqttPublishSession {
    pub fn new(client: AsyncClient, eventloop: EventLoop, backoff: Backoff, timeout: Duration) -> Self {
        Self {
            client,
            eventloop,
            state: ConnectionState::Disconnected,
            backoff,
            timeout,
            acks: AckTracker::default(),
        }
    }

    fn mark_disconnected(&mut self, reason: &dyn std::fmt::Display) {
        if self.state != ConnectionState::Disconnected {
            warn!("Publisher disconnected: {}", reason);
        }
        self.state = ConnectionState::Disconnected;
    }
}

#[async_trait]
impl PublishSession for MqttPublishSession {
    fn state(&self) -> ConnectionState {
        self.state
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.state = ConnectionState::Connecting;
        let eventloop = &mut self.eventloop;
        let acks = &mut self.acks;
        let handshake = async {
            loop {
                let event = eventloop.poll().await?;
                acks.observe(&event);
                if let Event::Incoming(Packet::ConnAck(_)) = event {
                    return Ok::<(), rumqttc::ConnectionError>(());
                }
            }
        };

        let outcome = tokio::time::timeout(self.timeout, handshake).await;
        match outcome {
            Ok(Ok(())) => {
                self.state = ConnectionState::Connected;
                self.backoff.reset();
                info!("Publisher connected");
                Ok(())
            }
            Ok(Err(e)) => {
                self.mark_disconnected(&e);
                Err(Error::Connection(e))
            }
            Err(_) => {
                self.mark_disconnected(&"handshake timed out");
                Err(Error::TransportDisconnected)
            }
        }
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)?;
        self.acks.queued();

        let eventloop = &mut self.eventloop;
        let acks = &mut self.acks;
        let acknowledged = async {
            loop {
                let event = eventloop.poll().await?;
                if acks.observe(&event) {
                    return Ok::<(), rumqttc::ConnectionError>(());
                }
            }
        };

        let outcome = tokio::time::timeout(self.timeout, acknowledged).await;
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.mark_disconnected(&e);
                Err(Error::Connection(e))
            }
            Err(_) => {
                self.mark_disconnected(&"no acknowledgement before timeout");
                Err(Error::TransportDisconnected)
            }
        }
    }

    async fn maintain(&mut self) -> Result<()> {
        match self.state {
            ConnectionState::Connected => match self.eventloop.poll().await {
                Ok(event) => {
                    self.acks.observe(&event);
                    debug!("Publisher event: {:?}", event);
                    Ok(())
                }
                Err(e) => {
                    self.mark_disconnected(&e);
                    Err(Error::Connection(e))
                }
            },
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                let delay = self.backoff.next_delay();
                tokio::time::sleep(delay).await;
                RECONNECT_ATTEMPTS_TOTAL.with_label_values(&["publisher"]).inc();
                self.reconnect().await
            }
        }
    }

    async fn close(&mut self) {
        if self.state == ConnectionState::Connected {
            if let Err(e) = self.client.try_disconnect() {
                warn!("Failed to request disconnect: {}", e);
            }
            drain_until_disconnect(&mut self.eventloop).await;
        }
        self.state = ConnectionState::Disconnected;
        info!("Publisher session closed");
    }
}

/// Publishes detection results to the single command topic.
pub struct CommandPublisher<S> {
    session: S,
    topic: String,
}

impl<S: PublishSession> CommandPublisher<S> {
    pub fn new(session: S, topic: impl Into<String>) -> Self {
        Self {
            session,
            topic: topic.into(),
        }
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    /// Returns whether the broker acknowledged the command. A disconnected
    /// session gets exactly one reconnect attempt first; failures are logged
    /// and the command is dropped.
    pub async fn send_command(&mut self, status: DetectionStatus) -> bool {
        if self.session.state() != ConnectionState::Connected {
            RECONNECT_ATTEMPTS_TOTAL.with_label_values(&["publisher"]).inc();
            if let Err(e) = self.session.reconnect().await {
                warn!(status = status.as_str(), "Dropping command, broker unreachable: {}", e);
                COMMAND_FAILURES_TOTAL.inc();
                return false;
            }
        }

        let payload = match serde_json::to_vec(&Command { status }) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode command: {}", e);
                COMMAND_FAILURES_TOTAL.inc();
                return false;
            }
        };

        match self.session.publish(&self.topic, payload).await {
            Ok(()) => {
                COMMANDS_PUBLISHED_TOTAL.inc();
                info!(topic = %self.topic, status = status.as_str(), "Command published");
                true
            }
            Err(e) => {
                error!(topic = %self.topic, status = status.as_str(), "Command publish failed: {}", e);
                COMMAND_FAILURES_TOTAL.inc();
                false
            }
        }
    }
}

/// Publishes queued commands until shutdown or until every sender is gone.
pub async fn run_publisher<S: PublishSession>(
    mut publisher: CommandPublisher<S>,
    mut rx: mpsc::Receiver<DetectionStatus>,
    shutdown: CancellationToken,
) {
    info!(topic = %publisher.topic, "Starting command publisher");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            command = rx.recv() => match command {
                Some(status) => {
                    publisher.send_command(status).await;
                }
                None => break,
            },
            result = publisher.session.maintain() => {
                if let Err(e) = result {
                    debug!("Publisher maintenance: {}", e);
                }
            }
        }
    }

    publisher.session.close().await;
}

/// Cloneable handle that queues commands for the publisher task.
#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: mpsc::Sender<DetectionStatus>,
}

impl CommandSender {
    pub fn try_send(&self, status: DetectionStatus) -> Result<()> {
        self.tx.try_send(status).map_err(|e| {
            match e {
                TrySendError::Full(_) => warn!("Command queue full, dropping {}", status.as_str()),
                TrySendError::Closed(_) => error!("Command queue closed"),
            }
            Error::ChannelSend
        })
    }
}

pub fn command_channel(capacity: usize) -> (CommandSender, mpsc::Receiver<DetectionStatus>) {
    let (tx, rx) = mpsc::channel(capacity);
    (CommandSender { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Calls {
        reconnects: usize,
        published: Vec<(String, Vec<u8>)>,
        closed: bool,
    }

    /// Session whose broker is reachable only when `reachable` is set.
    struct FakeSession {
        state: ConnectionState,
        reachable: bool,
        calls: Arc<Mutex<Calls>>,
    }

    impl FakeSession {
        fn new(state: ConnectionState, reachable: bool) -> (Self, Arc<Mutex<Calls>>) {
            let calls = Arc::new(Mutex::new(Calls::default()));
            (
                Self {
                    state,
                    reachable,
                    calls: calls.clone(),
                },
                calls,
            )
        }
    }

    #[async_trait]
    impl PublishSession for FakeSession {
        fn state(&self) -> ConnectionState {
            self.state
        }

        async fn reconnect(&mut self) -> Result<()> {
            self.calls.lock().unwrap().reconnects += 1;
            self.state = ConnectionState::Connecting;
            if self.reachable {
                self.state = ConnectionState::Connected;
                Ok(())
            } else {
                self.state = ConnectionState::Disconnected;
                Err(Error::TransportDisconnected)
            }
        }

        async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()> {
            assert_eq!(self.state, ConnectionState::Connected, "publish while not connected");
            self.calls
                .lock()
                .unwrap()
                .published
                .push((topic.to_string(), payload));
            Ok(())
        }

        async fn maintain(&mut self) -> Result<()> {
            std::future::pending().await
        }

        async fn close(&mut self) {
            self.calls.lock().unwrap().closed = true;
        }
    }

    #[tokio::test]
    async fn test_connected_session_publishes_without_reconnect() {
        let (session, calls) = FakeSession::new(ConnectionState::Connected, true);
        let mut publisher = CommandPublisher::new(session, "serangga/deteksi");

        assert!(publisher.send_command(DetectionStatus::Present).await);

        let calls = calls.lock().unwrap();
        assert_eq!(calls.reconnects, 0);
        assert_eq!(calls.published.len(), 1);
        assert_eq!(calls.published[0].0, "serangga/deteksi");
        assert_eq!(calls.published[0].1, br#"{"status":"present"}"#.to_vec());
    }

    #[tokio::test]
    async fn test_disconnected_session_reconnects_once_then_publishes() {
        let (session, calls) = FakeSession::new(ConnectionState::Disconnected, true);
        let mut publisher = CommandPublisher::new(session, "serangga/deteksi");

        assert!(publisher.send_command(DetectionStatus::Absent).await);
        assert_eq!(publisher.session().state(), ConnectionState::Connected);

        let calls = calls.lock().unwrap();
        assert_eq!(calls.reconnects, 1);
        assert_eq!(calls.published[0].1, br#"{"status":"absent"}"#.to_vec());
    }

    #[tokio::test]
    async fn test_unreachable_broker_fails_closed() {
        let (session, calls) = FakeSession::new(ConnectionState::Disconnected, false);
        let mut publisher = CommandPublisher::new(session, "serangga/deteksi");

        assert!(!publisher.send_command(DetectionStatus::Present).await);

        let calls = calls.lock().unwrap();
        assert_eq!(calls.reconnects, 1);
        assert!(calls.published.is_empty());
    }

    #[tokio::test]
    async fn test_run_publisher_drains_queue_and_closes() {
        let (session, calls) = FakeSession::new(ConnectionState::Connected, true);
        let publisher = CommandPublisher::new(session, "serangga/deteksi");
        let (sender, rx) = command_channel(4);

        sender.try_send(DetectionStatus::Present).unwrap();
        sender.try_send(DetectionStatus::Absent).unwrap();
        drop(sender);

        run_publisher(publisher, rx, CancellationToken::new()).await;

        let calls = calls.lock().unwrap();
        assert_eq!(calls.published.len(), 2);
        assert!(calls.closed);
    }

    fn sent(pkid: u16) -> Event {
        Event::Outgoing(Outgoing::Publish(pkid))
    }

    fn acked(pkid: u16) -> Event {
        Event::Incoming(Packet::PubAck(rumqttc::PubAck::new(pkid)))
    }

    #[test]
    fn test_ack_tracker_matches_packet_id() {
        let mut acks = AckTracker::default();
        acks.queued();
        assert!(!acks.observe(&sent(1)));
        assert!(!acks.observe(&acked(2)));
        assert!(acks.observe(&acked(1)));
        assert!(!acks.observe(&acked(1)));
    }

    #[test]
    fn test_late_ack_does_not_complete_next_publish() {
        let mut acks = AckTracker::default();

        // first command goes out and times out unacknowledged
        acks.queued();
        acks.observe(&sent(1));

        // after a reconnect the client resends packet 1 before the next command
        acks.queued();
        assert!(!acks.observe(&sent(1)));
        assert!(!acks.observe(&sent(2)));
        assert!(!acks.observe(&acked(1)));
        assert!(acks.observe(&acked(2)));
    }

    #[test]
    fn test_unwritten_publish_is_assigned_in_order() {
        let mut acks = AckTracker::default();

        // first command never reached the wire before its wait gave up
        acks.queued();
        acks.queued();
        assert!(!acks.observe(&sent(7)));
        assert!(!acks.observe(&acked(7)));
        assert!(!acks.observe(&sent(8)));
        assert!(acks.observe(&acked(8)));
    }

    #[test]
    fn test_command_sender_reports_full_and_closed() {
        let (sender, rx) = command_channel(1);
        sender.try_send(DetectionStatus::Present).unwrap();
        assert!(matches!(
            sender.try_send(DetectionStatus::Absent),
            Err(Error::ChannelSend)
        ));

        drop(rx);
        assert!(matches!(
            sender.try_send(DetectionStatus::Absent),
            Err(Error::ChannelSend)
        ));
    }
}
