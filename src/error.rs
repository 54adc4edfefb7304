//! Error types for the Granel gateway

use std::time::Duration;

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Granel gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// No response arrived before the exchange deadline
    #[error("{operation} timed out after {}ms", after.as_millis())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Explicit failure status reported by a device or controller
    #[error("device reported failure: {0}")]
    DeviceReported(String),

    /// A newer config push replaced this one before the device answered
    #[error("superseded: {0}")]
    Superseded(String),

    /// Device is unknown to the registry
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Device exists but has not been seen within the heartbeat window
    #[error("device {0} is not online")]
    DeviceOffline(String),

    /// A first-seen device announced itself without board/firmware metadata
    #[error("device {0} cannot be registered without board name and firmware version")]
    IncompleteDevice(String),

    /// Broker connection is not established
    #[error("mqtt client not connected")]
    NotConnected,

    /// MQTT client error
    #[error("mqtt error: {0}")]
    Mqtt(String),

    /// Weight-per-turn calibration produced no material
    #[error("calibration failed: {0}")]
    Calibration(String),

    /// Scale never reached zero after opening the dispense gate
    #[error("dispenser gate timeout: scale never reached zero after {attempts} attempts")]
    GateRelease { attempts: u32 },

    /// Hardware facade error
    #[error("hardware error: {0}")]
    Hardware(String),

    /// Job queue error
    #[error("queue error: {0}")]
    Queue(String),

    /// Input rejected before anything was sent or stored
    #[error("validation error: {0}")]
    Validation(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Resource already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    /// Whether the failure came from a missing response rather than an explicit answer
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
