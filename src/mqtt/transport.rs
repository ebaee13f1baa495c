//! Transport seam between the session manager and the broker.
//!
//! [`Connector`] opens a fresh link per (re)connect and [`BrokerLink`] is the
//! live session handle. The production pair wraps a rumqttc `AsyncClient` and
//! its `EventLoop`; tests drive the session manager with scripted links.

use super::config::{BrokerConfig, BrokerEndpoint};
use super::mqtt_handler::SessionError;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

const REQUEST_CAPACITY: usize = 10;
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// Result of one poll on a link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    Publish { channel: String, payload: Vec<u8> },
    /// Protocol traffic with nothing to dispatch (acks, pings, outgoing packets)
    Protocol,
}

/// One live broker session.
pub trait BrokerLink: Send {
    /// Queues a QoS 0 subscription for `channel`.
    fn subscribe(&mut self, channel: &str)
        -> impl Future<Output = Result<(), SessionError>> + Send;

    /// Drives protocol I/O until the next event.
    fn poll(&mut self) -> impl Future<Output = Result<LinkEvent, SessionError>> + Send;

    /// Best-effort goodbye to the broker before the link is dropped.
    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;
}

/// Opens links to a broker endpoint.
pub trait Connector: Send {
    type Link: BrokerLink + 'static;

    /// Opens the socket and completes the connect handshake.
    fn open(
        &mut self,
        endpoint: &BrokerEndpoint,
    ) -> impl Future<Output = Result<Self::Link, SessionError>> + Send;
}

pub struct MqttConnector {
    client_id: String,
    keep_alive: Duration,
    connect_timeout: Duration,
}

impl MqttConnector {
    pub fn new(config: &BrokerConfig) -> Self {
        MqttConnector {
            client_id: config.client_id.clone(),
            keep_alive: config.keep_alive(),
            connect_timeout: config.connect_timeout(),
        }
    }
}

impl Connector for MqttConnector {
    type Link = MqttLink;

    async fn open(&mut self, endpoint: &BrokerEndpoint) -> Result<MqttLink, SessionError> {
        let port: u16 = endpoint.port.parse().map_err(|_| {
            SessionError::InvalidEndpoint(format!("port '{}' is not a number", endpoint.port))
        })?;

        let mut mqtt_options = MqttOptions::new(self.client_id.clone(), endpoint.host.clone(), port);
        mqtt_options
            .set_keep_alive(self.keep_alive)
            .set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);

        // rumqttc opens the socket and sends CONNECT on the first poll
        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        debug!("CONNACK received: {:?}", ack);
                        return Ok(());
                    }
                    Ok(event) => debug!("Handshake event: {:?}", event),
                    Err(e) => return Err(SessionError::Connect(e.to_string())),
                }
            }
        };

        let handshake = tokio::time::timeout(self.connect_timeout, handshake).await;
        match handshake {
            Ok(Ok(())) => {
                info!(
                    "Connected to {}:{} as '{}'",
                    endpoint.host, endpoint.port, self.client_id
                );
                Ok(MqttLink { client, eventloop })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SessionError::Connect(format!(
                "no CONNACK from {}:{} within {:?}",
                endpoint.host, endpoint.port, self.connect_timeout
            ))),
        }
    }
}

pub struct MqttLink {
    client: AsyncClient,
    eventloop: EventLoop,
}

impl BrokerLink for MqttLink {
    async fn subscribe(&mut self, channel: &str) -> Result<(), SessionError> {
        self.client
            .subscribe(channel, QoS::AtMostOnce)
            .await
            .map_err(|e| SessionError::Subscribe {
                channel: channel.to_string(),
                reason: e.to_string(),
            })
    }

    async fn poll(&mut self) -> Result<LinkEvent, SessionError> {
        match self.eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => Ok(LinkEvent::Publish {
                channel: publish.topic,
                payload: publish.payload.to_vec(),
            }),
            Ok(event) => {
                debug!("Protocol event: {:?}", event);
                Ok(LinkEvent::Protocol)
            }
            Err(e) => Err(SessionError::Poll(e.to_string())),
        }
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self.client.try_disconnect() {
            warn!("Failed to queue DISCONNECT: {}", e);
            return;
        }

        // the request only leaves the socket while the event loop is polled
        let flush = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(DISCONNECT_GRACE, flush).await.is_err() {
            warn!("DISCONNECT not flushed within {:?}", DISCONNECT_GRACE);
        }
    }
}
