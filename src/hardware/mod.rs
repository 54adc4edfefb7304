//! Hardware access facade
//!
//! The machine controller speaks a request/response protocol of named
//! commands with a JSON payload. [`HardwareClient`] wraps any [`Hardware`]
//! implementation with typed helpers for motors and the scale.

mod simulated;

pub use simulated::SimulatedHardware;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::motion::MotorCommand;
use crate::{Error, Result};

/// Zero the scale
pub const TARE_SCALE: &str = "TARE_SCALE";

/// Read the scale
pub const GET_CURRENT_WEIGHT: &str = "GET_CURRENT_WEIGHT";

/// Read one axis position
pub const GET_AXIS_POSITION: &str = "GET_AXIS_POSITION";

/// Outcome reported by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Controller reply to a single command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareResponse {
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HardwareResponse {
    #[must_use]
    pub const fn ok(data: Option<Value>) -> Self {
        Self {
            status: ResponseStatus::Ok,
            data,
            message: None,
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            data: None,
            message: Some(message.into()),
        }
    }
}

/// Machine axes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
    A,
}

impl Axis {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::X => "X",
            Self::Y => "Y",
            Self::Z => "Z",
            Self::A => "A",
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Link to the machine controller
#[async_trait]
pub trait Hardware: Send + Sync {
    /// Send one command and wait for its reply
    ///
    /// # Errors
    ///
    /// Returns error if the link itself fails; a command the controller
    /// rejects comes back as an `error` response instead
    async fn send_command(&self, command: &str, payload: Value) -> Result<HardwareResponse>;
}

/// Typed helpers over a [`Hardware`] link
#[derive(Clone)]
pub struct HardwareClient {
    link: Arc<dyn Hardware>,
}

impl HardwareClient {
    #[must_use]
    pub fn new(link: Arc<dyn Hardware>) -> Self {
        Self { link }
    }

    /// Send a command, turning an `error` response into `Error::Hardware`
    ///
    /// # Errors
    ///
    /// Returns error if the link fails or the controller reports an error
    pub async fn send(&self, command: &str, payload: Value) -> Result<Option<Value>> {
        tracing::trace!(command, %payload, "hardware command");
        let response = self.link.send_command(command, payload).await?;
        match response.status {
            ResponseStatus::Ok => Ok(response.data),
            ResponseStatus::Error => Err(Error::Hardware(
                response
                    .message
                    .unwrap_or_else(|| format!("{command} failed")),
            )),
        }
    }

    /// Execute a motor movement
    ///
    /// # Errors
    ///
    /// Returns error if the controller rejects the movement
    pub async fn execute(&self, command: &MotorCommand) -> Result<Option<Value>> {
        let payload = command
            .value()
            .map_or_else(|| json!({}), |value| json!({ "value": value }));
        self.send(command.wire_name(), payload).await
    }

    /// Zero the scale
    ///
    /// # Errors
    ///
    /// Returns error if the controller rejects the command
    pub async fn tare_scale(&self) -> Result<()> {
        self.send(TARE_SCALE, json!({})).await.map(|_| ())
    }

    /// Current scale reading in grams
    ///
    /// # Errors
    ///
    /// Returns error if the controller rejects the command
    pub async fn current_weight(&self) -> Result<f64> {
        let data = self.send(GET_CURRENT_WEIGHT, json!({})).await?;
        Ok(number_field(data.as_ref(), "weight"))
    }

    /// Position of `axis` in millimetres
    ///
    /// # Errors
    ///
    /// Returns error if the controller rejects the command
    pub async fn axis_position(&self, axis: Axis) -> Result<f64> {
        let data = self
            .send(GET_AXIS_POSITION, json!({ "axis": axis.as_str() }))
            .await?;
        Ok(number_field(data.as_ref(), "positionMm"))
    }
}

fn number_field(data: Option<&Value>, field: &str) -> f64 {
    data.and_then(|d| d.get(field))
        .and_then(Value::as_f64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Replays canned responses and records what was sent
    struct Canned {
        response: HardwareResponse,
        sent: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl Hardware for Canned {
        async fn send_command(&self, command: &str, payload: Value) -> Result<HardwareResponse> {
            self.sent
                .lock()
                .unwrap()
                .push((command.to_string(), payload));
            Ok(self.response.clone())
        }
    }

    fn client(response: HardwareResponse) -> (HardwareClient, Arc<Canned>) {
        let canned = Arc::new(Canned {
            response,
            sent: Mutex::new(Vec::new()),
        });
        (HardwareClient::new(canned.clone()), canned)
    }

    #[tokio::test]
    async fn motor_commands_carry_value() {
        let (client, canned) = client(HardwareResponse::ok(None));
        client
            .execute(&MotorCommand::RotateRight { rotations: 2.5 })
            .await
            .unwrap();
        client.execute(&MotorCommand::GateOpen).await.unwrap();

        let sent = canned.sent.lock().unwrap();
        assert_eq!(
            sent[0],
            ("MOVE_Z_RIGHT_ROTATION".to_string(), json!({"value": 2.5}))
        );
        assert_eq!(sent[1], ("MOVE_A_OPEN".to_string(), json!({})));
    }

    #[tokio::test]
    async fn error_response_becomes_hardware_error() {
        let (client, _) = client(HardwareResponse::error("limit switch triggered"));
        let err = client.execute(&MotorCommand::MoveLeft).await.unwrap_err();
        assert!(matches!(err, Error::Hardware(ref m) if m == "limit switch triggered"));
    }

    #[tokio::test]
    async fn missing_weight_reads_as_zero() {
        let (client, _) = client(HardwareResponse::ok(None));
        assert!(client.current_weight().await.unwrap().abs() < f64::EPSILON);

        let (client, canned) = client_with_position();
        assert!((client.axis_position(Axis::Y).await.unwrap() - 200.0).abs() < f64::EPSILON);
        assert_eq!(canned.sent.lock().unwrap()[0].1, json!({"axis": "Y"}));
    }

    fn client_with_position() -> (HardwareClient, Arc<Canned>) {
        client(HardwareResponse::ok(Some(json!({"positionMm": 200}))))
    }
}
