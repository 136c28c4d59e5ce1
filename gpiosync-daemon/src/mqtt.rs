//! MQTT transport for one link.
//!
//! [`MqttLink`] is the [`ChannelLink`] the engine publishes through;
//! [`MqttDriver`] owns the rumqttc event loop, keeps the link's connection
//! state current, and forwards transitions and inbound publishes to the
//! engine queue. Reconnects are the driver's business: after an error it
//! waits `reconnect_delay` and polls again.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet,
    Transport,
};
use tokio::sync::{broadcast, mpsc};

use gpiosync_core::topics::{TopicScheme, STATUS_OFFLINE};
use gpiosync_core::{ConnectionState, LinkConfig, LinkEvent, LinkId, QoS};
use gpiosync_engine::{ChannelLink, ConnectionCell, LinkError, MessageId};

use crate::error::{io_err, DaemonError};
use crate::processor::EngineInput;

/// Outstanding requests rumqttc buffers before `try_publish` reports full.
const REQUEST_CAPACITY: usize = 64;
/// rumqttc refuses keep-alives shorter than this.
const MIN_KEEP_ALIVE_SECS: u64 = 5;
/// How long a stopping driver keeps polling to flush the final publishes.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

fn to_mqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

/// Build broker options for `link` from its config section.
///
/// The cloud link registers a retained `offline` last will on the status
/// topic so the broker announces an ungraceful drop.
pub fn mqtt_options(
    link: LinkId,
    config: &LinkConfig,
    topics: &TopicScheme,
) -> Result<MqttOptions, DaemonError> {
    let mut options = MqttOptions::new(
        config.client_id_for(topics.device_id(), link),
        config.host.clone(),
        config.port,
    );
    options.set_keep_alive(Duration::from_secs(
        config.keep_alive_secs.max(MIN_KEEP_ALIVE_SECS),
    ));
    options.set_clean_session(true);

    if let Some(username) = &config.username {
        options.set_credentials(username.clone(), config.password.clone().unwrap_or_default());
    }

    if link == LinkId::Cloud {
        options.set_last_will(LastWill::new(
            topics.status_topic(),
            STATUS_OFFLINE.as_bytes().to_vec(),
            rumqttc::QoS::AtLeastOnce,
            true,
        ));
    }

    if let Some(ca_file) = &config.ca_file {
        let ca = std::fs::read(ca_file).map_err(|e| io_err(ca_file, e))?;
        if ca.is_empty() {
            return Err(DaemonError::Mqtt {
                link,
                reason: format!("CA file {} is empty", ca_file.display()),
            });
        }
        options.set_transport(Transport::tls(ca, None, None));
    }

    Ok(options)
}

/// Publish side of an MQTT connection.
pub struct MqttLink {
    id: LinkId,
    client: AsyncClient,
    cell: Arc<ConnectionCell>,
}

impl MqttLink {
    /// Create the client and its driver. Nothing touches the network until
    /// the driver is polled.
    pub fn connect(
        id: LinkId,
        config: &LinkConfig,
        topics: &TopicScheme,
    ) -> Result<(Arc<MqttLink>, MqttDriver), DaemonError> {
        let options = mqtt_options(id, config, topics)?;
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let cell = Arc::new(ConnectionCell::new());
        tracing::info!(
            link = %id,
            host = %config.host,
            port = config.port,
            tls = config.ca_file.is_some(),
            "mqtt link configured",
        );
        let link = Arc::new(MqttLink {
            id,
            client,
            cell: Arc::clone(&cell),
        });
        let driver = MqttDriver {
            id,
            eventloop,
            cell,
            reconnect_delay: config.reconnect_delay(),
        };
        Ok((link, driver))
    }

    /// Queue a clean DISCONNECT so the broker does not fire the last will.
    pub fn disconnect(&self) {
        if let Err(err) = self.client.try_disconnect() {
            tracing::debug!(link = %self.id, error = %err, "disconnect request not queued");
        }
    }
}

impl ChannelLink for MqttLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn state(&self) -> ConnectionState {
        self.cell.get()
    }

    fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<MessageId, LinkError> {
        if !self.cell.get().is_connected() {
            return Err(LinkError::Unavailable(self.id));
        }
        self.client
            .try_publish(topic, to_mqtt_qos(qos), retain, payload.to_vec())
            .map_err(|err| LinkError::Publish {
                link: self.id,
                reason: err.to_string(),
            })?;
        Ok(self.cell.next_message_id())
    }

    fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), LinkError> {
        if !self.cell.get().is_connected() {
            return Err(LinkError::Unavailable(self.id));
        }
        self.client
            .try_subscribe(filter, to_mqtt_qos(qos))
            .map_err(|err| LinkError::Subscribe {
                link: self.id,
                reason: err.to_string(),
            })
    }
}

/// Event-loop side of an MQTT connection.
pub struct MqttDriver {
    id: LinkId,
    eventloop: EventLoop,
    cell: Arc<ConnectionCell>,
    reconnect_delay: Duration,
}

impl MqttDriver {
    pub fn id(&self) -> LinkId {
        self.id
    }

    pub async fn run(
        mut self,
        events: mpsc::Sender<EngineInput>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), DaemonError> {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                polled = self.eventloop.poll() => match polled {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code != ConnectReturnCode::Success {
                            tracing::warn!(link = %self.id, code = ?ack.code, "broker refused connection");
                            continue;
                        }
                        self.cell.set(ConnectionState::Connected);
                        if !forward(self.id, &events, LinkEvent::Connected(self.id)).await {
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let event = LinkEvent::Message {
                            link: self.id,
                            topic: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                        };
                        if !forward(self.id, &events, event).await {
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        if !mark_disconnected(self.id, &self.cell, &events).await {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(link = %self.id, error = %err, "mqtt connection error");
                        if !mark_disconnected(self.id, &self.cell, &events).await {
                            break;
                        }
                        tokio::select! {
                            _ = shutdown_rx.recv() => break,
                            _ = tokio::time::sleep(self.reconnect_delay) => {}
                        }
                    }
                },
            }
        }

        self.drain().await;
        Ok(())
    }

    // Keep polling until our DISCONNECT goes out so the final status
    // publish queued by the engine reaches the broker.
    async fn drain(&mut self) {
        if !self.cell.get().is_connected() {
            return;
        }
        let flushed = tokio::time::timeout(DRAIN_TIMEOUT, async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        if flushed.is_err() {
            tracing::warn!(link = %self.id, "timed out flushing mqtt link on shutdown");
        }
        self.cell.set(ConnectionState::Disconnected);
        tracing::info!(link = %self.id, "mqtt link closed");
    }
}

// The link flips to Disconnected before the engine hears about it, so a
// heartbeat racing the notification is refused by the link itself. Only the
// Connected -> Disconnected edge is forwarded.
async fn mark_disconnected(
    id: LinkId,
    cell: &ConnectionCell,
    events: &mpsc::Sender<EngineInput>,
) -> bool {
    if cell.set(ConnectionState::Disconnected).is_connected() {
        return forward(id, events, LinkEvent::Disconnected(id)).await;
    }
    true
}

// `false` once the engine task has gone away. Must not borrow the driver:
// `EventLoop` is not `Sync`.
async fn forward(id: LinkId, events: &mpsc::Sender<EngineInput>, event: LinkEvent) -> bool {
    if events.send(EngineInput::Link(event)).await.is_err() {
        tracing::debug!(link = %id, "engine queue closed, stopping driver");
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn enabled(host: &str, port: u16) -> LinkConfig {
        LinkConfig {
            enabled: true,
            host: host.to_string(),
            port,
            ..LinkConfig::cloud_defaults()
        }
    }

    #[test]
    fn cloud_options_carry_offline_last_will() {
        let topics = TopicScheme::new("esp32_02");
        let options = mqtt_options(LinkId::Cloud, &enabled("broker", 8883), &topics).unwrap();
        let will = options.last_will().expect("last will");
        assert_eq!(will.topic, "esp32_02/system/status");
        assert_eq!(&will.message[..], b"offline");
        assert!(will.retain);
        assert_eq!(will.qos, rumqttc::QoS::AtLeastOnce);
        assert_eq!(options.client_id(), "esp32_02-cloud");
    }

    #[test]
    fn local_options_have_no_last_will() {
        let topics = TopicScheme::new("esp32_02");
        let options = mqtt_options(LinkId::Local, &enabled("192.168.1.10", 1883), &topics).unwrap();
        assert!(options.last_will().is_none());
        assert_eq!(options.broker_address(), ("192.168.1.10".to_string(), 1883));
    }

    #[test]
    fn keep_alive_is_clamped() {
        let topics = TopicScheme::new("dev");
        let mut config = enabled("broker", 1883);
        config.keep_alive_secs = 1;
        let options = mqtt_options(LinkId::Local, &config, &topics).unwrap();
        assert_eq!(options.keep_alive(), Duration::from_secs(MIN_KEEP_ALIVE_SECS));
    }

    #[test]
    fn missing_ca_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let mut config = enabled("broker", 8883);
        config.ca_file = Some(tmp.path().join("missing.pem"));
        let err = mqtt_options(LinkId::Cloud, &config, &TopicScheme::new("dev")).unwrap_err();
        assert!(matches!(err, DaemonError::Io { .. }), "got: {err}");
    }

    #[test]
    fn empty_ca_file_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let ca = tmp.path().join("ca.pem");
        std::fs::write(&ca, "").unwrap();
        let mut config = enabled("broker", 8883);
        config.ca_file = Some(ca);
        let err = mqtt_options(LinkId::Cloud, &config, &TopicScheme::new("dev")).unwrap_err();
        assert!(matches!(err, DaemonError::Mqtt { link: LinkId::Cloud, .. }), "got: {err}");
    }

    #[tokio::test]
    async fn link_refuses_publish_before_connack() {
        let (link, _driver) =
            MqttLink::connect(LinkId::Local, &enabled("127.0.0.1", 1883), &TopicScheme::new("dev"))
                .unwrap();
        assert_eq!(link.state(), ConnectionState::Disconnected);
        let err = link
            .publish("dev/gpio/2/state", b"ON", QoS::AtLeastOnce, true)
            .unwrap_err();
        assert!(matches!(err, LinkError::Unavailable(LinkId::Local)));
    }

    mod broker {
        use std::time::Duration;

        use tokio::io::AsyncReadExt;
        use tokio::net::{TcpListener, TcpStream};

        pub const CONNECT: u8 = 1;
        pub const DISCONNECT: u8 = 14;

        /// CONNACK with the given return code.
        pub fn connack(code: u8) -> [u8; 4] {
            [0x20, 0x02, 0x00, code]
        }

        /// Read one MQTT packet and return its type nibble.
        pub async fn read_packet(stream: &mut TcpStream) -> Option<u8> {
            let header = stream.read_u8().await.ok()?;
            let mut remaining = 0usize;
            let mut shift = 0;
            loop {
                let byte = stream.read_u8().await.ok()?;
                remaining |= usize::from(byte & 0x7f) << shift;
                if byte & 0x80 == 0 {
                    break;
                }
                shift += 7;
            }
            let mut body = vec![0; remaining];
            stream.read_exact(&mut body).await.ok()?;
            Some(header >> 4)
        }

        /// Accept the next client session and consume its CONNECT.
        pub async fn accept_session(listener: &TcpListener) -> TcpStream {
            let (mut stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
                .await
                .expect("client reconnects")
                .expect("accept");
            assert_eq!(read_packet(&mut stream).await, Some(CONNECT));
            stream
        }
    }

    async fn next_event(events: &mut mpsc::Receiver<EngineInput>) -> LinkEvent {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Some(EngineInput::Link(event))) => event,
            Ok(Some(_)) => panic!("driver only forwards link events"),
            Ok(None) => panic!("event queue closed"),
            Err(_) => panic!("no link event within 5s"),
        }
    }

    #[tokio::test]
    async fn driver_tracks_sessions_and_flushes_disconnect_on_shutdown() {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut config = enabled("127.0.0.1", port);
        config.reconnect_delay_ms = 20;
        let (link, driver) =
            MqttLink::connect(LinkId::Local, &config, &TopicScheme::new("dev")).unwrap();
        let (events_tx, mut events) = mpsc::channel(16);
        let (shutdown, _) = broadcast::channel(4);
        let task = tokio::spawn(driver.run(events_tx, shutdown.subscribe()));

        // Accepted session, then the broker drops it.
        let mut session = broker::accept_session(&listener).await;
        session.write_all(&broker::connack(0)).await.unwrap();
        assert_eq!(next_event(&mut events).await, LinkEvent::Connected(LinkId::Local));
        assert_eq!(link.state(), ConnectionState::Connected);
        drop(session);
        assert_eq!(next_event(&mut events).await, LinkEvent::Disconnected(LinkId::Local));
        assert_eq!(link.state(), ConnectionState::Disconnected);
        assert!(matches!(
            link.publish("dev/gpio/2/state", b"ON", QoS::AtLeastOnce, true),
            Err(LinkError::Unavailable(LinkId::Local))
        ));

        // Refused session: still down, and no second Disconnected is sent.
        let mut session = broker::accept_session(&listener).await;
        session.write_all(&broker::connack(5)).await.unwrap();
        drop(session);

        let mut session = broker::accept_session(&listener).await;
        assert_eq!(link.state(), ConnectionState::Disconnected);
        session.write_all(&broker::connack(0)).await.unwrap();
        assert_eq!(next_event(&mut events).await, LinkEvent::Connected(LinkId::Local));
        assert_eq!(link.state(), ConnectionState::Connected);

        link.disconnect();
        shutdown.send(()).unwrap();
        let mut saw_disconnect = false;
        while let Some(kind) = broker::read_packet(&mut session).await {
            if kind == broker::DISCONNECT {
                saw_disconnect = true;
                break;
            }
        }
        assert!(saw_disconnect, "DISCONNECT reaches the broker before the driver stops");
        drop(session);

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("driver stops")
            .expect("join")
            .expect("clean exit");
        assert_eq!(link.state(), ConnectionState::Disconnected);
    }
}
