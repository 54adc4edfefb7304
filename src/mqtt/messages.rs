//! Wire messages exchanged with controllers
//!
//! Field names are camelCase on the wire, except the `server/online` notice
//! which keeps the snake_case names the firmware expects.

use serde::{Deserialize, Serialize};

use crate::db::PeripheralType;

/// Reserved id the server itself uses on the discovery topic
pub const SERVER_DEVICE_ID: &str = "server";

/// Presence as announced on the discovery topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Online,
    Offline,
}

/// `{prefix}/discovery`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryMessage {
    pub device_id: String,
    pub status: Presence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub board_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<serde_json::Value>,
}

/// `{prefix}/disconnected`, usually the broker-published last will
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectionMessage {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<serde_json::Value>,
}

/// `{prefix}/server/online`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerOnlineMessage {
    pub server_ip: String,
    pub server_port: u16,
    pub status: String,
    pub timestamp: String,
}

/// One entry of a full configuration push
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeripheralConfigEntry {
    pub component_id: String,
    #[serde(rename = "type")]
    pub peripheral_type: PeripheralType,
    pub config: serde_json::Value,
}

/// `{prefix}/{uuid}/config`: the complete peripheral set of a device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeripheralConfigSet {
    pub peripherals: Vec<PeripheralConfigEntry>,
}

/// `{prefix}/{uuid}/component/{id}/command`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandMessage {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub request_id: String,
    pub timestamp: i64,
}

/// Outcome reported by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackStatus {
    Success,
    Error,
}

/// `{prefix}/{uuid}/component/{id}/feedback`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandFeedback {
    pub request_id: String,
    pub status: FeedbackStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<serde_json::Value>,
}

/// Per-component verdict inside a config feedback
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeripheralFeedback {
    pub component_id: String,
    pub status: FeedbackStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `{prefix}/{uuid}/config/feedback`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFeedback {
    pub status: FeedbackStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peripherals: Option<Vec<PeripheralFeedback>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<serde_json::Value>,
}

impl ConfigFeedback {
    /// Overall success with no failing per-component entry
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == FeedbackStatus::Success
            && self
                .peripherals
                .iter()
                .flatten()
                .all(|p| p.status == FeedbackStatus::Success)
    }

    /// Entry reported for one component
    #[must_use]
    pub fn entry(&self, component_id: &str) -> Option<&PeripheralFeedback> {
        self.peripherals
            .iter()
            .flatten()
            .find(|p| p.component_id == component_id)
    }

    /// Whether the device applied `component_id` successfully
    #[must_use]
    pub fn applied(&self, component_id: &str) -> bool {
        self.entry(component_id)
            .is_some_and(|p| p.status == FeedbackStatus::Success)
    }

    /// Best available failure description
    #[must_use]
    pub fn failure_message(&self) -> String {
        self.message
            .clone()
            .or_else(|| {
                self.peripherals
                    .iter()
                    .flatten()
                    .find(|p| p.status == FeedbackStatus::Error)
                    .and_then(|p| {
                        p.message
                            .as_ref()
                            .map(|m| format!("{}: {m}", p.component_id))
                    })
            })
            .unwrap_or_else(|| "device rejected configuration".to_string())
    }
}

/// `{prefix}/{uuid}/ping` and the echoed `{prefix}/{uuid}/pong`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingMessage {
    pub request_id: String,
    pub timestamp: i64,
}
