//! rumqttc transport and the reconnecting event loop

use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::bridge::{ConnectionState, MqttBridge, Transport};
use crate::config::MqttConfig;
use crate::{Error, Result};

/// Repeated connection errors are logged at most this often
const ERROR_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Capacity of the client request channel
const REQUEST_CAPACITY: usize = 100;

/// Broker client id for this host
#[must_use]
pub fn client_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("granel-backend-{host}")
}

/// Build client options from configuration
#[must_use]
pub fn client_options(config: &MqttConfig, client_id: &str) -> MqttOptions {
    let mut options = MqttOptions::new(client_id, &config.host, config.port);
    options.set_keep_alive(config.keep_alive);
    options.set_clean_session(true);

    if let Some(username) = &config.username {
        options.set_credentials(username, config.password.as_deref().unwrap_or_default());
    }
    if config.use_tls {
        options.set_transport(rumqttc::Transport::tls_with_default_config());
    }

    options
}

/// Transport backed by a rumqttc client
#[derive(Clone)]
pub struct RumqttTransport {
    client: AsyncClient,
}

impl RumqttTransport {
    /// Create the client and its (not yet polled) event loop
    #[must_use]
    pub fn new(options: MqttOptions) -> (Self, EventLoop) {
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        (Self { client }, eventloop)
    }

    /// Underlying client
    #[must_use]
    pub const fn client(&self) -> &AsyncClient {
        &self.client
    }
}

#[async_trait]
impl Transport for RumqttTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| Error::Mqtt(format!("publish to {topic} failed: {e}")))
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| Error::Mqtt(format!("subscribe to {topic} failed: {e}")))
    }
}

/// Rate limiter for repeated connection error logs
#[derive(Debug)]
pub struct ErrorThrottle {
    interval: Duration,
    last: Option<Instant>,
    suppressed: u64,
}

impl ErrorThrottle {
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            suppressed: 0,
        }
    }

    /// Whether this error should be logged; returns the number suppressed since the last log
    pub fn check(&mut self) -> Option<u64> {
        let now = Instant::now();
        if self.last.is_some_and(|last| now.duration_since(last) < self.interval) {
            self.suppressed += 1;
            return None;
        }
        self.last = Some(now);
        Some(std::mem::take(&mut self.suppressed))
    }

    /// Forget history after a successful connection
    pub fn reset(&mut self) {
        self.last = None;
        self.suppressed = 0;
    }
}

/// Drive the broker connection until `shutdown` fires
///
/// Transport errors move the bridge to `Disconnected`; after
/// `reconnect_period` the loop polls again, which makes rumqttc reconnect.
/// Each `ConnAck` hands control to [`MqttBridge::on_connected`] on a separate
/// task so the poll loop keeps running while subscriptions are restored.
pub async fn run_event_loop(
    bridge: Arc<MqttBridge>,
    mut eventloop: EventLoop,
    client: AsyncClient,
    reconnect_period: Duration,
    shutdown: CancellationToken,
) {
    let mut throttle = ErrorThrottle::new(ERROR_LOG_INTERVAL);
    bridge.set_state(ConnectionState::Connecting);

    loop {
        let event = tokio::select! {
            () = shutdown.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                tracing::info!("connected to MQTT broker");
                throttle.reset();
                let bridge = Arc::clone(&bridge);
                tokio::spawn(async move { bridge.on_connected().await });
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let bridge = Arc::clone(&bridge);
                tokio::spawn(async move {
                    bridge.handle_message(&publish.topic, &publish.payload).await;
                });
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                tracing::trace!("subscription acknowledged");
            }
            Ok(_) => {}
            Err(e) => {
                bridge.set_state(ConnectionState::Disconnected);
                if let Some(suppressed) = throttle.check() {
                    tracing::error!(error = %e, suppressed, "MQTT connection error");
                } else {
                    tracing::debug!(error = %e, "MQTT connection error");
                }

                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(reconnect_period) => {}
                }
                tracing::debug!("reconnecting to MQTT broker");
                bridge.set_state(ConnectionState::Connecting);
            }
        }
    }

    if let Err(e) = client.disconnect().await {
        tracing::debug!(error = %e, "disconnect request failed");
    }
    bridge.set_state(ConnectionState::Disconnected);
    tracing::info!("MQTT event loop stopped");
}

/// Best guess at the address devices can reach this host on
#[must_use]
pub fn detect_local_ip() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            // No packet is sent; connect only selects a route
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map_or_else(|_| "127.0.0.1".to_string(), |addr| addr.ip().to_string())
}
