//! TOML configuration file loading
//!
//! Supports `~/.config/granel/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{Error, Result};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct GranelConfigFile {
    /// Broker connection
    #[serde(default)]
    pub mqtt: MqttFileConfig,

    /// Values announced to devices in the `server/online` notice
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Row store location
    #[serde(default)]
    pub database: DatabaseFileConfig,

    /// Correlated exchange deadlines
    #[serde(default)]
    pub timeouts: TimeoutsFileConfig,

    /// Job pipeline workers
    #[serde(default)]
    pub queues: QueuesFileConfig,

    /// Dispensing controller tuning
    #[serde(default)]
    pub dispense: DispenseFileConfig,

    /// Hardware facade
    #[serde(default)]
    pub hardware: HardwareFileConfig,
}

/// Broker configuration
#[derive(Debug, Default, Deserialize)]
pub struct MqttFileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: Option<bool>,
    pub keep_alive_secs: Option<u64>,
    pub reconnect_secs: Option<u64>,
    /// Topic namespace (defaults to `cnc-granel`)
    pub topic_prefix: Option<String>,
}

/// Announced server configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// Address announced to devices; detected when absent
    pub address: Option<String>,
    pub port: Option<u16>,
}

/// Database configuration
#[derive(Debug, Default, Deserialize)]
pub struct DatabaseFileConfig {
    pub path: Option<String>,
}

/// Exchange deadlines in milliseconds
#[derive(Debug, Default, Deserialize)]
pub struct TimeoutsFileConfig {
    pub ping_ms: Option<u64>,
    pub command_ms: Option<u64>,
    pub config_ms: Option<u64>,
}

/// Worker pool configuration
#[derive(Debug, Default, Deserialize)]
pub struct QueuesFileConfig {
    pub intake_concurrency: Option<usize>,
    pub prepare_concurrency: Option<usize>,
    pub motor_concurrency: Option<usize>,
    pub peripheral_concurrency: Option<usize>,
    pub poll_interval_ms: Option<u64>,
    pub motor_wait_timeout_secs: Option<u64>,
}

/// Dispensing configuration
#[derive(Debug, Default, Deserialize)]
pub struct DispenseFileConfig {
    pub gate_poll_interval_ms: Option<u64>,
    pub gate_poll_attempts: Option<u32>,
    /// Hold a machine-wide lock for the whole order sequence
    pub serialize_orders: Option<bool>,
}

/// Simulated hardware configuration
#[derive(Debug, Default, Deserialize)]
pub struct HardwareFileConfig {
    pub actuation_delay_ms: Option<u64>,
    pub sensor_delay_ms: Option<u64>,
    pub weight_per_rotation: Option<f64>,
}

/// Load the TOML config file
///
/// An explicit `path` must exist and parse. Without one, the standard path is
/// tried and `GranelConfigFile::default()` is returned if it is missing or broken.
///
/// # Errors
///
/// Returns error if an explicitly requested file cannot be read or parsed
pub fn load_config_file(path: Option<&Path>) -> Result<GranelConfigFile> {
    if let Some(path) = path {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), "loaded config file");
        return Ok(config);
    }

    let Some(path) = config_file_path() else {
        return Ok(GranelConfigFile::default());
    };

    if !path.exists() {
        return Ok(GranelConfigFile::default());
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                Ok(config)
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                Ok(GranelConfigFile::default())
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            Ok(GranelConfigFile::default())
        }
    }
}

/// Return the config file path: `~/.config/granel/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("granel").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_file() {
        let parsed: GranelConfigFile = toml::from_str(
            r#"
            [mqtt]
            host = "broker.local"
            port = 8883

            [dispense]
            gate_poll_attempts = 7
            "#,
        )
        .unwrap();

        assert_eq!(parsed.mqtt.host.as_deref(), Some("broker.local"));
        assert_eq!(parsed.mqtt.port, Some(8883));
        assert_eq!(parsed.dispense.gate_poll_attempts, Some(7));
        assert!(parsed.queues.motor_concurrency.is_none());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let result = load_config_file(Some(Path::new("/nonexistent/granel.toml")));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn explicit_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server]\nport = 4000\n").unwrap();

        let parsed = load_config_file(Some(&path)).unwrap();
        assert_eq!(parsed.server.port, Some(4000));
    }
}
