//! Device registry types

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::db::Device;

/// A device counts as online while it was seen within this window
pub const HEARTBEAT_WINDOW: Duration = Duration::seconds(60);

/// Whether a device last seen at `last_seen` is online at `now`
#[must_use]
pub fn is_online(last_seen: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now.signed_duration_since(last_seen) <= HEARTBEAT_WINDOW
}

/// Device view with the online flag derived at read time
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub uuid: String,
    pub ip: Option<String>,
    pub firmware_version: String,
    pub board_name: String,
    pub last_seen_online_at: DateTime<Utc>,
    pub last_ping_rtt_ms: Option<u64>,
    pub online: bool,
}

impl DeviceInfo {
    /// Derive the view of a stored device at `now`
    #[must_use]
    pub fn at(device: Device, now: DateTime<Utc>) -> Self {
        Self {
            online: is_online(device.last_seen_online_at, now),
            uuid: device.uuid,
            ip: device.ip,
            firmware_version: device.firmware_version,
            board_name: device.board_name,
            last_seen_online_at: device.last_seen_online_at,
            last_ping_rtt_ms: device.last_ping_rtt_ms,
        }
    }
}

impl From<Device> for DeviceInfo {
    fn from(device: Device) -> Self {
        Self::at(device, Utc::now())
    }
}

/// Presence change published to live-status consumers
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// First discovery of a device
    Connected(DeviceInfo),
    /// Known device announced itself again
    Updated(DeviceInfo),
    /// Device reported or was detected as gone
    Disconnected { uuid: String },
}

impl DeviceEvent {
    /// Uuid of the device the event is about
    #[must_use]
    pub fn uuid(&self) -> &str {
        match self {
            Self::Connected(info) | Self::Updated(info) => &info.uuid,
            Self::Disconnected { uuid } => uuid,
        }
    }
}
