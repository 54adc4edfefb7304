//! In-process machine simulation
//!
//! Stands in for the controller when no machine is attached. Screw
//! rotations move material onto the scale at a fixed rate and opening the
//! gate empties it, which is enough for a full dispensing run.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{
    Axis, GET_AXIS_POSITION, GET_CURRENT_WEIGHT, Hardware, HardwareResponse, TARE_SCALE,
};
use crate::Result;
use crate::config::HardwareConfig;

/// Carriage (X) positions in millimetres
const X_LEFT: f64 = -100.0;
const X_RIGHT: f64 = 100.0;

/// Y travel between hopper slots
const HOPPER_PITCH: f64 = 100.0;

/// Gate (A) angle when open
const GATE_OPEN: f64 = 90.0;

/// Z travel per screw rotation
const Z_PER_ROTATION: f64 = 10.0;

#[derive(Debug, Default)]
struct State {
    weight: f64,
    positions: HashMap<Axis, f64>,
    faults: HashMap<String, String>,
    history: Vec<String>,
}

impl State {
    fn set(&mut self, axis: Axis, value: f64) {
        self.positions.insert(axis, value);
    }

    fn position(&self, axis: Axis) -> f64 {
        self.positions.get(&axis).copied().unwrap_or_default()
    }
}

/// Simulated controller
#[derive(Debug)]
pub struct SimulatedHardware {
    config: HardwareConfig,
    state: Mutex<State>,
}

impl SimulatedHardware {
    #[must_use]
    pub fn new(config: HardwareConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
        }
    }

    /// Make the next `command` fail with `message`
    pub fn fail_next(&self, command: &str, message: &str) {
        self.lock()
            .faults
            .insert(command.to_string(), message.to_string());
    }

    /// Put material on the scale directly
    pub fn set_weight(&self, grams: f64) {
        self.lock().weight = grams;
    }

    #[must_use]
    pub fn weight(&self) -> f64 {
        self.lock().weight
    }

    #[must_use]
    pub fn position(&self, axis: Axis) -> f64 {
        self.lock().position(axis)
    }

    /// Commands received so far, oldest first
    #[must_use]
    pub fn history(&self) -> Vec<String> {
        self.lock().history.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn delay_for(&self, command: &str) -> Duration {
        match command {
            TARE_SCALE | GET_CURRENT_WEIGHT | GET_AXIS_POSITION => self.config.sensor_delay,
            _ => self.config.actuation_delay,
        }
    }

    fn apply(&self, command: &str, payload: &Value) -> HardwareResponse {
        let value = payload.get("value").and_then(Value::as_f64).unwrap_or_default();
        let per_rotation = self.config.weight_per_rotation;
        let mut state = self.lock();
        state.history.push(command.to_string());

        if let Some(message) = state.faults.remove(command) {
            return HardwareResponse::error(message);
        }

        match command {
            "MOVE_X_TO_CENTER" | "MOVE_X_HOME" => state.set(Axis::X, 0.0),
            "MOVE_X_TO_LEFT" => state.set(Axis::X, X_LEFT),
            "MOVE_X_TO_RIGHT" => state.set(Axis::X, X_RIGHT),
            "MOVE_Y_TO_HOPPER" => state.set(Axis::Y, value * HOPPER_PITCH),
            "MOVE_Y_HOME" => state.set(Axis::Y, 0.0),
            "MOVE_Z_RIGHT_ROTATION" => {
                state.weight += value * per_rotation;
                let z = state.position(Axis::Z) + value * Z_PER_ROTATION;
                state.set(Axis::Z, z);
            }
            "MOVE_Z_LEFT_ROTATION" => {
                state.weight = (state.weight - value * per_rotation).max(0.0);
                let z = state.position(Axis::Z) - value * Z_PER_ROTATION;
                state.set(Axis::Z, z);
            }
            "MOVE_A_OPEN" => {
                state.set(Axis::A, GATE_OPEN);
                state.weight = 0.0;
            }
            "MOVE_A_CLOSE" | "MOVE_A_HOME" => state.set(Axis::A, 0.0),
            TARE_SCALE => state.weight = 0.0,
            GET_CURRENT_WEIGHT => {
                return HardwareResponse::ok(Some(json!({ "weight": state.weight })));
            }
            GET_AXIS_POSITION => {
                let axis = match payload.get("axis").and_then(Value::as_str) {
                    Some(a) if a.eq_ignore_ascii_case("x") => Axis::X,
                    Some(a) if a.eq_ignore_ascii_case("z") => Axis::Z,
                    Some(a) if a.eq_ignore_ascii_case("a") => Axis::A,
                    _ => Axis::Y,
                };
                return HardwareResponse::ok(Some(json!({ "positionMm": state.position(axis) })));
            }
            other => tracing::debug!(command = other, "simulated controller ignoring command"),
        }

        HardwareResponse::ok(None)
    }
}

#[async_trait]
impl Hardware for SimulatedHardware {
    async fn send_command(&self, command: &str, payload: Value) -> Result<HardwareResponse> {
        let delay = self.delay_for(command);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(self.apply(command, &payload))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::hardware::HardwareClient;
    use crate::motion::MotorCommand;

    fn client() -> (HardwareClient, Arc<SimulatedHardware>) {
        let sim = Arc::new(SimulatedHardware::new(HardwareConfig::default()));
        (HardwareClient::new(sim.clone()), sim)
    }

    #[tokio::test(start_paused = true)]
    async fn rotations_move_material() {
        let (client, sim) = client();
        client.tare_scale().await.unwrap();
        client
            .execute(&MotorCommand::RotateRight { rotations: 2.0 })
            .await
            .unwrap();
        assert!((client.current_weight().await.unwrap() - 100.0).abs() < 1e-9);

        client
            .execute(&MotorCommand::RotateLeft { rotations: 5.0 })
            .await
            .unwrap();
        assert!(sim.weight().abs() < 1e-9);
        assert!((sim.position(Axis::Z) + 30.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn axes_follow_commands() {
        let (client, _) = client();
        client
            .execute(&MotorCommand::MoveToHopper { hopper_index: 3 })
            .await
            .unwrap();
        client.execute(&MotorCommand::MoveRight).await.unwrap();
        client.execute(&MotorCommand::GateOpen).await.unwrap();

        assert!((client.axis_position(Axis::Y).await.unwrap() - 300.0).abs() < 1e-9);
        assert!((client.axis_position(Axis::X).await.unwrap() - 100.0).abs() < 1e-9);
        assert!((client.axis_position(Axis::A).await.unwrap() - 90.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn gate_open_empties_scale() {
        let (client, sim) = client();
        sim.set_weight(42.0);
        client.execute(&MotorCommand::GateOpen).await.unwrap();
        assert!(client.current_weight().await.unwrap().abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn injected_fault_fails_once() {
        let (client, sim) = client();
        sim.fail_next("MOVE_X_TO_LEFT", "carriage jammed");

        let err = client.execute(&MotorCommand::MoveLeft).await.unwrap_err();
        assert!(err.to_string().contains("carriage jammed"));
        client.execute(&MotorCommand::MoveLeft).await.unwrap();
        assert_eq!(sim.history(), vec!["MOVE_X_TO_LEFT", "MOVE_X_TO_LEFT"]);
    }
}
