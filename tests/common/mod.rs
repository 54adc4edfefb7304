//! Shared test utilities

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use granel_gateway::config::{HardwareConfig, TimeoutConfig};
use granel_gateway::devices::{DeviceInfo, DeviceRegistry};
use granel_gateway::hardware::SimulatedHardware;
use granel_gateway::mqtt::{ConnectionState, MqttBridge, ServerAnnouncement, Topics, Transport};
use granel_gateway::{DbPool, db};
use serde_json::{Value, json};
use tokio::sync::mpsc;

pub const DEVICE: &str = "esp32-0001";

/// Set up an in-memory test database
#[must_use]
pub fn setup_test_db() -> DbPool {
    db::init_memory().expect("failed to init test db")
}

/// One message the bridge published
#[derive(Debug, Clone)]
pub struct Published {
    pub topic: String,
    pub payload: Value,
}

/// Transport that records traffic instead of talking to a broker
pub struct MockTransport {
    tx: mpsc::UnboundedSender<Published>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Published>>,
    subscriptions: Mutex<Vec<String>>,
}

impl MockTransport {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Next published message, in publish order
    pub async fn next_publish(&self) -> Published {
        tokio::time::timeout(Duration::from_secs(5), self.rx.lock().await.recv())
            .await
            .expect("nothing was published")
            .expect("transport closed")
    }

    /// Whether anything is waiting to be read
    pub async fn has_pending(&self) -> bool {
        !self.rx.lock().await.is_empty()
    }

    /// Every subscribe call so far
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> granel_gateway::Result<()> {
        let payload = serde_json::from_slice(&payload).expect("bridge published invalid JSON");
        self.tx
            .send(Published {
                topic: topic.to_string(),
                payload,
            })
            .expect("receiver dropped");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> granel_gateway::Result<()> {
        self.subscriptions.lock().unwrap().push(topic.to_string());
        Ok(())
    }
}

/// Bridge wired to a mock transport
pub struct Harness {
    pub pool: DbPool,
    pub registry: DeviceRegistry,
    pub transport: Arc<MockTransport>,
    pub bridge: Arc<MqttBridge>,
    pub topics: Topics,
}

impl Harness {
    /// Connected bridge with default timeouts
    pub fn new() -> Self {
        let pool = setup_test_db();
        let registry = DeviceRegistry::new(pool.clone());
        let transport = Arc::new(MockTransport::new());
        let topics = Topics::new("cnc-granel");
        let bridge = Arc::new(MqttBridge::new(
            transport.clone(),
            registry.clone(),
            topics.clone(),
            TimeoutConfig::default(),
            ServerAnnouncement {
                address: "10.0.0.5".into(),
                port: 3000,
            },
        ));
        bridge.set_state(ConnectionState::Connected);

        Self {
            pool,
            registry,
            transport,
            bridge,
            topics,
        }
    }

    /// Deliver an inbound message as the broker would
    pub async fn deliver(&self, topic: &str, payload: &Value) {
        self.bridge
            .handle_message(topic, payload.to_string().as_bytes())
            .await;
    }

    /// Announce a device on the discovery topic
    pub async fn announce(&self, uuid: &str) -> DeviceInfo {
        self.deliver(
            &self.topics.discovery(),
            &json!({
                "deviceId": uuid,
                "status": "online",
                "ip": "10.0.0.42",
                "boardName": "esp32-devkit",
                "firmwareVersion": "1.4.2",
            }),
        )
        .await;
        self.registry
            .get(uuid)
            .unwrap()
            .expect("device was not registered")
    }
}

/// Simulated machine without actuation delays
pub fn fast_hardware() -> Arc<SimulatedHardware> {
    Arc::new(SimulatedHardware::new(HardwareConfig {
        actuation_delay: Duration::ZERO,
        sensor_delay: Duration::ZERO,
        weight_per_rotation: 50.0,
    }))
}
