//! Configuration management for the Granel gateway
//!
//! Values are layered env > TOML file > defaults. Environment names follow
//! the deployment conventions of the machine (`MQTT_BROKER_HOST`, ...).

pub mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::Result;
use file::GranelConfigFile;

/// Default topic namespace shared with the device firmware
pub const DEFAULT_TOPIC_PREFIX: &str = "cnc-granel";

/// Granel gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to data directory (database, etc)
    pub data_dir: PathBuf,

    /// Path to the `SQLite` database file
    pub db_path: PathBuf,

    /// Broker connection
    pub mqtt: MqttConfig,

    /// Values announced in the `server/online` notice
    pub server: ServerConfig,

    /// Correlated exchange deadlines
    pub timeouts: TimeoutConfig,

    /// Job pipeline workers
    pub queues: QueueConfig,

    /// Dispensing controller tuning
    pub dispense: DispenseConfig,

    /// Simulated hardware backend
    pub hardware: HardwareConfig,
}

/// MQTT broker configuration
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// TLS is also implied by port 8883
    pub use_tls: bool,
    pub keep_alive: Duration,
    /// Wait between reconnection attempts
    pub reconnect_period: Duration,
    pub topic_prefix: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            use_tls: false,
            keep_alive: Duration::from_secs(60),
            reconnect_period: Duration::from_secs(5),
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
        }
    }
}

/// Announced server identity
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address devices should use to reach this backend; detected when `None`
    pub address: Option<String>,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: None,
            port: 3000,
        }
    }
}

/// Deadlines for correlated exchanges
#[derive(Debug, Clone, Copy)]
pub struct TimeoutConfig {
    pub ping: Duration,
    pub command: Duration,
    pub config: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            ping: Duration::from_secs(3),
            command: Duration::from_secs(5),
            config: Duration::from_secs(5),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub intake_concurrency: usize,
    pub prepare_concurrency: usize,
    pub motor_concurrency: usize,
    pub peripheral_concurrency: usize,
    /// Idle workers re-check the store at this interval
    pub poll_interval: Duration,
    /// Upper bound on waiting for a single motor job
    pub motor_wait_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            intake_concurrency: 1,
            prepare_concurrency: 1,
            motor_concurrency: 1,
            peripheral_concurrency: 1,
            poll_interval: Duration::from_millis(500),
            motor_wait_timeout: Duration::from_secs(60),
        }
    }
}

/// Dispensing controller configuration
#[derive(Debug, Clone, Copy)]
pub struct DispenseConfig {
    pub gate_poll_interval: Duration,
    pub gate_poll_attempts: u32,
    /// Hold the machine lock for the whole sequence of an order
    pub serialize_orders: bool,
}

impl Default for DispenseConfig {
    fn default() -> Self {
        Self {
            gate_poll_interval: Duration::from_secs(2),
            gate_poll_attempts: 5,
            serialize_orders: true,
        }
    }
}

/// Simulated hardware configuration
#[derive(Debug, Clone, Copy)]
pub struct HardwareConfig {
    pub actuation_delay: Duration,
    pub sensor_delay: Duration,
    /// Grams moved by one screw rotation
    pub weight_per_rotation: f64,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            actuation_delay: Duration::from_secs(1),
            sensor_delay: Duration::from_millis(100),
            weight_per_rotation: 50.0,
        }
    }
}

impl Config {
    /// Load configuration from the environment and the TOML file
    ///
    /// # Errors
    ///
    /// Returns error if an explicit config file cannot be loaded
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let fc = file::load_config_file(config_path)?;
        let data_dir = default_data_dir();
        std::fs::create_dir_all(&data_dir).ok();

        Ok(Self::from_sources(fc, data_dir, |key| std::env::var(key).ok()))
    }

    /// Build configuration from a parsed file and an environment lookup
    #[must_use]
    #[allow(clippy::needless_pass_by_value)]
    pub fn from_sources<F>(fc: GranelConfigFile, data_dir: PathBuf, env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse_u64 = |key: &str| env(key).and_then(|v| v.parse::<u64>().ok());
        let parse_usize = |key: &str| env(key).and_then(|v| v.parse::<usize>().ok());
        let parse_bool = |key: &str| env(key).map(|v| v == "1" || v.eq_ignore_ascii_case("true"));

        let mqtt_defaults = MqttConfig::default();
        let port = env("MQTT_BROKER_PORT")
            .and_then(|v| v.parse().ok())
            .or(fc.mqtt.port)
            .unwrap_or(mqtt_defaults.port);
        let mqtt = MqttConfig {
            host: env("MQTT_BROKER_HOST")
                .or(fc.mqtt.host)
                .unwrap_or(mqtt_defaults.host),
            port,
            username: env("MQTT_BROKER_USERNAME").or(fc.mqtt.username),
            password: env("MQTT_BROKER_PASSWORD").or(fc.mqtt.password),
            use_tls: parse_bool("MQTT_BROKER_USE_TLS")
                .or(fc.mqtt.use_tls)
                .unwrap_or(false)
                || port == 8883,
            keep_alive: parse_u64("MQTT_KEEP_ALIVE_SECS")
                .or(fc.mqtt.keep_alive_secs)
                .map_or(mqtt_defaults.keep_alive, Duration::from_secs),
            reconnect_period: parse_u64("MQTT_RECONNECT_SECS")
                .or(fc.mqtt.reconnect_secs)
                .map_or(mqtt_defaults.reconnect_period, Duration::from_secs),
            topic_prefix: env("MQTT_TOPIC_PREFIX")
                .or(fc.mqtt.topic_prefix)
                .unwrap_or(mqtt_defaults.topic_prefix),
        };

        let server = ServerConfig {
            address: env("SERVER_ADDRESS").or(fc.server.address),
            port: env("SERVER_PORT")
                .or_else(|| env("PORT"))
                .and_then(|v| v.parse().ok())
                .or(fc.server.port)
                .unwrap_or_else(|| ServerConfig::default().port),
        };

        let db_path = env("GRANEL_DB_PATH")
            .or(fc.database.path)
            .map_or_else(|| data_dir.join("granel.db"), PathBuf::from);

        let td = TimeoutConfig::default();
        let timeouts = TimeoutConfig {
            ping: parse_u64("GRANEL_PING_TIMEOUT_MS")
                .or(fc.timeouts.ping_ms)
                .map_or(td.ping, Duration::from_millis),
            command: parse_u64("GRANEL_COMMAND_TIMEOUT_MS")
                .or(fc.timeouts.command_ms)
                .map_or(td.command, Duration::from_millis),
            config: parse_u64("GRANEL_CONFIG_TIMEOUT_MS")
                .or(fc.timeouts.config_ms)
                .map_or(td.config, Duration::from_millis),
        };

        let qd = QueueConfig::default();
        let queues = QueueConfig {
            intake_concurrency: parse_usize("GRANEL_INTAKE_CONCURRENCY")
                .or(fc.queues.intake_concurrency)
                .unwrap_or(qd.intake_concurrency)
                .max(1),
            prepare_concurrency: parse_usize("GRANEL_PREPARE_CONCURRENCY")
                .or(fc.queues.prepare_concurrency)
                .unwrap_or(qd.prepare_concurrency)
                .max(1),
            motor_concurrency: parse_usize("GRANEL_MOTOR_CONCURRENCY")
                .or(fc.queues.motor_concurrency)
                .unwrap_or(qd.motor_concurrency)
                .max(1),
            peripheral_concurrency: parse_usize("GRANEL_PERIPHERAL_CONCURRENCY")
                .or(fc.queues.peripheral_concurrency)
                .unwrap_or(qd.peripheral_concurrency)
                .max(1),
            poll_interval: parse_u64("GRANEL_QUEUE_POLL_MS")
                .or(fc.queues.poll_interval_ms)
                .map_or(qd.poll_interval, Duration::from_millis),
            motor_wait_timeout: parse_u64("GRANEL_MOTOR_WAIT_TIMEOUT_SECS")
                .or(fc.queues.motor_wait_timeout_secs)
                .map_or(qd.motor_wait_timeout, Duration::from_secs),
        };

        let dd = DispenseConfig::default();
        let dispense = DispenseConfig {
            gate_poll_interval: parse_u64("GRANEL_GATE_POLL_MS")
                .or(fc.dispense.gate_poll_interval_ms)
                .map_or(dd.gate_poll_interval, Duration::from_millis),
            gate_poll_attempts: env("GRANEL_GATE_POLL_ATTEMPTS")
                .and_then(|v| v.parse().ok())
                .or(fc.dispense.gate_poll_attempts)
                .unwrap_or(dd.gate_poll_attempts),
            serialize_orders: parse_bool("GRANEL_SERIALIZE_ORDERS")
                .or(fc.dispense.serialize_orders)
                .unwrap_or(dd.serialize_orders),
        };

        let hd = HardwareConfig::default();
        let hardware = HardwareConfig {
            actuation_delay: parse_u64("GRANEL_SIM_ACTUATION_MS")
                .or(fc.hardware.actuation_delay_ms)
                .map_or(hd.actuation_delay, Duration::from_millis),
            sensor_delay: parse_u64("GRANEL_SIM_SENSOR_MS")
                .or(fc.hardware.sensor_delay_ms)
                .map_or(hd.sensor_delay, Duration::from_millis),
            weight_per_rotation: env("GRANEL_SIM_WEIGHT_PER_ROTATION")
                .and_then(|v| v.parse().ok())
                .or(fc.hardware.weight_per_rotation)
                .unwrap_or(hd.weight_per_rotation),
        };

        Self {
            data_dir,
            db_path,
            mqtt,
            server,
            timeouts,
            queues,
            dispense,
            hardware,
        }
    }
}

/// Data directory (`~/.local/share/granel` on Linux)
fn default_data_dir() -> PathBuf {
    std::env::var("GRANEL_DATA_DIR").map_or_else(
        |_| {
            directories::BaseDirs::new()
                .map_or_else(|| PathBuf::from("."), |d| d.data_dir().join("granel"))
        },
        PathBuf::from,
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn build(fc: GranelConfigFile, vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_sources(fc, PathBuf::from("/tmp/granel"), move |k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_match_machine_conventions() {
        let config = build(GranelConfigFile::default(), &[]);

        assert_eq!(config.mqtt.host, "localhost");
        assert_eq!(config.mqtt.port, 1883);
        assert!(!config.mqtt.use_tls);
        assert_eq!(config.mqtt.topic_prefix, "cnc-granel");
        assert_eq!(config.timeouts.ping, Duration::from_secs(3));
        assert_eq!(config.timeouts.command, Duration::from_secs(5));
        assert_eq!(config.dispense.gate_poll_interval, Duration::from_secs(2));
        assert_eq!(config.dispense.gate_poll_attempts, 5);
        assert!(config.dispense.serialize_orders);
        assert_eq!(config.db_path, PathBuf::from("/tmp/granel/granel.db"));
    }

    #[test]
    fn env_overrides_file() {
        let fc: GranelConfigFile = toml::from_str(
            r#"
            [mqtt]
            host = "from-file"
            port = 1884
            "#,
        )
        .unwrap();

        let config = build(fc, &[("MQTT_BROKER_HOST", "from-env")]);
        assert_eq!(config.mqtt.host, "from-env");
        assert_eq!(config.mqtt.port, 1884);
    }

    #[test]
    fn tls_implied_by_secure_port() {
        let config = build(GranelConfigFile::default(), &[("MQTT_BROKER_PORT", "8883")]);
        assert!(config.mqtt.use_tls);
    }

    #[test]
    fn concurrency_never_zero() {
        let config = build(
            GranelConfigFile::default(),
            &[("GRANEL_PREPARE_CONCURRENCY", "0")],
        );
        assert_eq!(config.queues.prepare_concurrency, 1);
    }
}
