//! Request/response bridge over the MQTT transport

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use super::messages::{
    CommandFeedback, CommandMessage, ConfigFeedback, DisconnectionMessage, DiscoveryMessage,
    FeedbackStatus, PeripheralConfigSet, PingMessage, SERVER_DEVICE_ID, ServerOnlineMessage,
};
use super::pending::PendingTable;
use super::topics::{InboundTopic, Topics};
use crate::config::TimeoutConfig;
use crate::devices::DeviceRegistry;
use crate::{Error, Result};

/// Outbound side of the broker connection
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish with at-least-once delivery
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Subscribe to a topic
    async fn subscribe(&self, topic: &str) -> Result<()>;
}

/// Receives every config feedback, whether or not a push is pending
#[async_trait]
pub trait ConfigFeedbackHandler: Send + Sync {
    async fn on_config_feedback(&self, uuid: &str, feedback: &ConfigFeedback);
}

/// Broker connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Identity announced on `server/online`
#[derive(Debug, Clone)]
pub struct ServerAnnouncement {
    pub address: String,
    pub port: u16,
}

/// Correlation layer between callers and controllers
pub struct MqttBridge {
    transport: Arc<dyn Transport>,
    topics: Topics,
    registry: DeviceRegistry,
    timeouts: TimeoutConfig,
    announcement: ServerAnnouncement,
    state: watch::Sender<ConnectionState>,
    /// Topics restored after every reconnect
    subscriptions: Mutex<BTreeSet<String>>,
    pings: PendingTable<()>,
    commands: PendingTable<CommandFeedback>,
    configs: PendingTable<ConfigFeedback>,
    config_handler: RwLock<Option<Arc<dyn ConfigFeedbackHandler>>>,
}

impl MqttBridge {
    /// Create a bridge; it starts disconnected
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: DeviceRegistry,
        topics: Topics,
        timeouts: TimeoutConfig,
        announcement: ServerAnnouncement,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let subscriptions = BTreeSet::from([topics.discovery(), topics.disconnected()]);

        Self {
            transport,
            topics,
            registry,
            timeouts,
            announcement,
            state,
            subscriptions: Mutex::new(subscriptions),
            pings: PendingTable::new(),
            commands: PendingTable::new(),
            configs: PendingTable::new(),
            config_handler: RwLock::new(None),
        }
    }

    /// Topic layout in use
    #[must_use]
    pub const fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Device registry the bridge feeds
    #[must_use]
    pub const fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe connection state changes
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Whether the transport is connected
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Record a transition driven by the event loop
    pub fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    /// Install the asynchronous config feedback consumer
    pub fn set_config_feedback_handler(&self, handler: Arc<dyn ConfigFeedbackHandler>) {
        *self
            .config_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Number of exchanges currently awaiting a response
    #[must_use]
    pub fn pending_exchanges(&self) -> usize {
        self.pings.len() + self.commands.len() + self.configs.len()
    }

    /// Topics that will be restored on reconnect
    #[must_use]
    pub fn tracked_subscriptions(&self) -> Vec<String> {
        self.lock_subscriptions().iter().cloned().collect()
    }

    /// Broker session established: restore subscriptions and announce
    pub async fn on_connected(&self) {
        self.set_state(ConnectionState::Connected);

        let topics = self.tracked_subscriptions();
        for topic in &topics {
            if let Err(e) = self.transport.subscribe(topic).await {
                tracing::warn!(topic = %topic, error = %e, "failed to restore subscription");
            }
        }
        tracing::info!(count = topics.len(), "subscriptions restored");

        if let Err(e) = self.announce_online().await {
            tracing::warn!(error = %e, "failed to publish server online notice");
        }
    }

    async fn announce_online(&self) -> Result<()> {
        let notice = ServerOnlineMessage {
            server_ip: self.announcement.address.clone(),
            server_port: self.announcement.port,
            status: "online".to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        self.publish_json(&self.topics.server_online(), &notice).await?;
        tracing::info!(
            address = %self.announcement.address,
            port = self.announcement.port,
            "server online notice published"
        );
        Ok(())
    }

    /// Track a topic and subscribe now if connected
    async fn ensure_subscribed(&self, topic: String) {
        let newly_tracked = self.lock_subscriptions().insert(topic.clone());
        if !newly_tracked || !self.is_connected() {
            return;
        }
        if let Err(e) = self.transport.subscribe(&topic).await {
            tracing::warn!(topic = %topic, error = %e, "subscribe failed; will retry on reconnect");
        } else {
            tracing::debug!(topic = %topic, "subscribed");
        }
    }

    /// Measure round-trip time to a device
    ///
    /// Does not require the device to be online.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` without a broker session, or `Timeout`
    pub async fn ping(&self, uuid: &str, timeout: Option<Duration>) -> Result<u64> {
        self.require_connected()?;
        let timeout = timeout.unwrap_or(self.timeouts.ping);
        self.ensure_subscribed(self.topics.pong(uuid)).await;

        let request_id = Uuid::new_v4().to_string();
        let exchange = self.pings.register(request_id.clone());
        let started = Instant::now();

        self.publish_json(
            &self.topics.ping(uuid),
            &PingMessage {
                request_id,
                timestamp: chrono::Utc::now().timestamp_millis(),
            },
        )
        .await?;

        exchange.wait(timeout, "ping").await?;
        let rtt_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::debug!(device = %uuid, rtt_ms, "pong received");
        Ok(rtt_ms)
    }

    /// Send a command to one component and wait for its feedback
    ///
    /// # Errors
    ///
    /// Returns a precondition error (`NotConnected`, `DeviceNotFound`,
    /// `DeviceOffline`), `Timeout`, or `DeviceReported` when the device
    /// answered with an error status
    pub async fn publish_command(
        &self,
        uuid: &str,
        component_id: &str,
        command: &str,
        payload: Option<serde_json::Value>,
        timeout: Option<Duration>,
    ) -> Result<CommandFeedback> {
        self.require_connected()?;
        self.require_online(uuid)?;
        let timeout = timeout.unwrap_or(self.timeouts.command);
        self.ensure_subscribed(self.topics.command_feedback(uuid, component_id))
            .await;

        let request_id = Uuid::new_v4().to_string();
        let exchange = self.commands.register(request_id.clone());

        self.publish_json(
            &self.topics.command(uuid, component_id),
            &CommandMessage {
                command: command.to_string(),
                payload,
                request_id,
                timestamp: chrono::Utc::now().timestamp_millis(),
            },
        )
        .await?;
        tracing::info!(device = %uuid, component = %component_id, command = %command, "command published");

        let feedback = exchange.wait(timeout, "command").await?;
        match feedback.status {
            FeedbackStatus::Success => Ok(feedback),
            FeedbackStatus::Error => Err(Error::DeviceReported(
                feedback
                    .message
                    .unwrap_or_else(|| format!("command {command} failed")),
            )),
        }
    }

    /// Push the complete peripheral set to a device and wait for its verdict
    ///
    /// A push still pending for the same device is cancelled with
    /// `Superseded`.
    ///
    /// # Errors
    ///
    /// Returns a precondition error, `Timeout`, `Superseded`, or
    /// `DeviceReported` unless the device reported success for the push and
    /// for every listed peripheral
    pub async fn publish_config(
        &self,
        uuid: &str,
        config: &PeripheralConfigSet,
        timeout: Option<Duration>,
    ) -> Result<ConfigFeedback> {
        self.require_connected()?;
        self.require_online(uuid)?;
        let timeout = timeout.unwrap_or(self.timeouts.config);
        self.ensure_subscribed(self.topics.config_feedback(uuid)).await;

        let exchange = self.configs.register(uuid);
        tracing::debug!(device = %uuid, pending = self.configs.len(), "config push registered");

        self.publish_json(&self.topics.config(uuid), config).await?;
        tracing::info!(device = %uuid, peripherals = config.peripherals.len(), "config published");

        let feedback = exchange.wait(timeout, "config").await?;
        if feedback.is_success() {
            Ok(feedback)
        } else {
            Err(Error::DeviceReported(feedback.failure_message()))
        }
    }

    /// Route one inbound message
    pub async fn handle_message(&self, topic: &str, payload: &[u8]) {
        let Some(inbound) = self.topics.parse(topic) else {
            tracing::debug!(topic = %topic, "ignoring message on unknown topic");
            return;
        };

        match inbound {
            InboundTopic::Discovery => self.handle_discovery(payload).await,
            InboundTopic::Disconnected => self.handle_disconnection(payload),
            InboundTopic::Pong { uuid } => self.handle_pong(uuid, payload),
            InboundTopic::CommandFeedback { uuid, component_id } => {
                self.handle_command_feedback(uuid, component_id, payload);
            }
            InboundTopic::ConfigFeedback { uuid } => {
                self.handle_config_feedback(uuid, payload).await;
            }
        }
    }

    async fn handle_discovery(&self, payload: &[u8]) {
        let Some(message) = decode::<DiscoveryMessage>("discovery", payload) else {
            return;
        };
        if message.device_id == SERVER_DEVICE_ID {
            return;
        }

        tracing::debug!(device = %message.device_id, status = ?message.status, "discovery");
        let registered = self.registry.register(
            &message.device_id,
            message.ip.as_deref(),
            message.board_name.as_deref(),
            message.firmware_version.as_deref(),
        );

        match registered {
            Ok(_) => {
                self.ensure_subscribed(self.topics.config_feedback(&message.device_id))
                    .await;
            }
            Err(Error::IncompleteDevice(_)) => {}
            Err(e) => {
                tracing::error!(device = %message.device_id, error = %e, "failed to register device");
            }
        }
    }

    fn handle_disconnection(&self, payload: &[u8]) {
        let Some(message) = decode::<DisconnectionMessage>("disconnected", payload) else {
            return;
        };
        tracing::info!(
            device = %message.device_id,
            reason = message.reason.as_deref().unwrap_or("unspecified"),
            "disconnection notice"
        );
        if let Err(e) = self.registry.mark_disconnected(&message.device_id) {
            tracing::error!(device = %message.device_id, error = %e, "failed to mark device disconnected");
        }
    }

    fn handle_pong(&self, uuid: &str, payload: &[u8]) {
        let Some(message) = decode::<PingMessage>("pong", payload) else {
            return;
        };
        match self.pings.complete(&message.request_id, Ok(())) {
            Some(elapsed) => {
                let rtt_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
                self.registry.update_last_ping_rtt(uuid, rtt_ms);
            }
            None => {
                tracing::debug!(device = %uuid, request_id = %message.request_id, "pong without pending ping");
            }
        }
    }

    fn handle_command_feedback(&self, uuid: &str, component_id: &str, payload: &[u8]) {
        let Some(feedback) = decode::<CommandFeedback>("command feedback", payload) else {
            return;
        };
        let request_id = feedback.request_id.clone();
        if self.commands.complete(&request_id, Ok(feedback)).is_none() {
            tracing::debug!(
                device = %uuid,
                component = %component_id,
                request_id = %request_id,
                "command feedback without pending command"
            );
        }
    }

    async fn handle_config_feedback(&self, uuid: &str, payload: &[u8]) {
        let Some(feedback) = decode::<ConfigFeedback>("config feedback", payload) else {
            return;
        };

        if self.configs.complete(uuid, Ok(feedback.clone())).is_none() {
            tracing::debug!(device = %uuid, "config feedback without pending push");
        }

        let handler = self
            .config_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler {
            handler.on_config_feedback(uuid, &feedback).await;
        }
    }

    fn require_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    fn require_online(&self, uuid: &str) -> Result<()> {
        match self.registry.get(uuid)? {
            None => Err(Error::DeviceNotFound(uuid.to_string())),
            Some(device) if !device.online => Err(Error::DeviceOffline(uuid.to_string())),
            Some(_) => Ok(()),
        }
    }

    async fn publish_json<T: Serialize + Sync>(&self, topic: &str, message: &T) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        self.transport.publish(topic, payload).await
    }

    fn lock_subscriptions(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn decode<T: serde::de::DeserializeOwned>(kind: &str, payload: &[u8]) -> Option<T> {
    match serde_json::from_slice(payload) {
        Ok(message) => Some(message),
        Err(e) => {
            tracing::warn!(kind, error = %e, "dropping unparseable message");
            None
        }
    }
}
