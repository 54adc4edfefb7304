//! Peripheral kinds, configuration validation, and commands

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::db::PeripheralType;
use crate::{Error, Result};

/// Longest accepted component id
pub const MAX_COMPONENT_ID_LEN: usize = 50;

/// Check a component id: non-empty, bounded, `[A-Za-z0-9_-]` only
///
/// # Errors
///
/// Returns `Validation` describing the first violated rule
pub fn validate_component_id(component_id: &str) -> Result<()> {
    if component_id.is_empty() {
        return Err(Error::Validation("componentId cannot be empty".into()));
    }
    if component_id.len() > MAX_COMPONENT_ID_LEN {
        return Err(Error::Validation(format!(
            "componentId cannot exceed {MAX_COMPONENT_ID_LEN} characters"
        )));
    }
    if !component_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(Error::Validation(
            "componentId can only contain alphanumeric characters, hyphens, and underscores"
                .into(),
        ));
    }
    Ok(())
}

/// LED configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedConfig {
    pub pin: u8,
}

impl LedConfig {
    /// Parse and range-check a raw LED configuration
    ///
    /// # Errors
    ///
    /// Returns `Validation` unless `pin` is an integer in `0..=255`
    pub fn from_value(config: &serde_json::Value) -> Result<Self> {
        let pin = config
            .get("pin")
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| {
                Error::Validation("LED config must have a valid integer pin number".into())
            })?;
        let pin = u8::try_from(pin)
            .map_err(|_| Error::Validation("LED pin must be between 0 and 255".into()))?;
        Ok(Self { pin })
    }
}

/// Validate a configuration for `peripheral_type` and return its canonical form
///
/// # Errors
///
/// Returns `Validation` if the configuration is malformed
pub fn normalize_config(
    peripheral_type: PeripheralType,
    config: &serde_json::Value,
) -> Result<serde_json::Value> {
    match peripheral_type {
        PeripheralType::Led => {
            let led = LedConfig::from_value(config)?;
            Ok(json!({ "pin": led.pin }))
        }
    }
}

/// Commands an LED understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedCommand {
    On,
    Off,
}

impl LedCommand {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
        }
    }
}

impl fmt::Display for LedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedCommand {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "on" => Ok(Self::On),
            "off" => Ok(Self::Off),
            other => Err(Error::Validation(format!("invalid LED command: {other}"))),
        }
    }
}

/// Payload of a `peripheral-commands` job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeripheralCommandJob {
    pub device_uuid: String,
    pub component_id: String,
    #[serde(rename = "type")]
    pub peripheral_type: PeripheralType,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}
