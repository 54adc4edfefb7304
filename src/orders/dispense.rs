//! Closed-loop dispensing
//!
//! The screw output per rotation varies with the product, so the sequence
//! measures one calibration turn and then approaches the target in shrinking
//! phases, re-reading the scale after each. Phases are fractions of the
//! target weight; the first one absorbs what the calibration turn already
//! delivered.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use super::{OrderPayload, hopper_index};
use crate::config::DispenseConfig;
use crate::hardware::HardwareClient;
use crate::motion::{HomingAxis, MotorCommand, MotorDriver};
use crate::{Error, Result};

/// Fractions of the target after the bulk phase
const FINE_PHASES: [f64; 3] = [0.07, 0.02, 0.01];

/// Share of the target delivered by the end of the bulk phase
const BULK_SHARE: f64 = 0.9;

/// Phase fractions given the share `initial_fraction` of the target that the
/// calibration turn delivered
#[must_use]
pub fn build_phases(initial_fraction: f64) -> [f64; 4] {
    let bulk = (BULK_SHARE - initial_fraction).max(0.0);
    [bulk, FINE_PHASES[0], FINE_PHASES[1], FINE_PHASES[2]]
}

/// Result of a completed dispense, stored on the preparation job
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispenseReport {
    pub order_id: String,
    pub target_grams: f64,
    pub weight_per_turn: f64,
    /// Scale reading before the gate opened
    pub dispensed_grams: f64,
    /// Screw rotations in execution order, calibration turn first
    pub rotations: Vec<f64>,
}

/// Runs the dispensing sequence of an order
#[derive(Clone)]
pub struct Dispenser {
    motors: Arc<dyn MotorDriver>,
    hardware: HardwareClient,
    config: DispenseConfig,
    machine: Option<Arc<Mutex<()>>>,
}

impl Dispenser {
    /// Orders share `machine` as a lock when `config.serialize_orders` is set
    #[must_use]
    pub fn new(
        motors: Arc<dyn MotorDriver>,
        hardware: HardwareClient,
        config: DispenseConfig,
        machine: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            motors,
            hardware,
            machine: config.serialize_orders.then_some(machine),
            config,
        }
    }

    /// Dispense `order` from start to park
    ///
    /// Movement steps are keyed `{order_id}:{attempt}:{step}`, so an attempt
    /// never repeats a rotation it already completed while a new attempt
    /// starts over from the tare. Any failing step aborts the sequence where
    /// it stands; nothing is rolled back.
    ///
    /// # Errors
    ///
    /// Returns `Calibration` if the calibration turn moved nothing,
    /// `GateRelease` if the scale never emptied, or the error of any failed
    /// movement or reading
    pub async fn dispense(&self, order: &OrderPayload, attempt: &str) -> Result<DispenseReport> {
        let hopper = hopper_index(&order.hopper_id)?;

        let _machine = match &self.machine {
            Some(lock) => {
                tracing::debug!(order_id = %order.order_id, "waiting for machine");
                Some(lock.lock().await)
            }
            None => None,
        };
        tracing::info!(order_id = %order.order_id, attempt, hopper, grams = order.weight_grams, "dispensing");

        let run = Run {
            dispenser: self,
            order_id: &order.order_id,
            attempt,
        };

        run.motor(MotorCommand::Home { axis: HomingAxis::A }, "home-a").await?;
        run.motor(MotorCommand::Home { axis: HomingAxis::X }, "home-x").await?;
        run.motor(MotorCommand::Home { axis: HomingAxis::Y }, "home-y").await?;

        run.motor(MotorCommand::MoveToCenter, "center").await?;
        run.motor(MotorCommand::MoveToHopper { hopper_index: hopper }, "hopper").await?;
        run.motor(MotorCommand::GateClose, "gate-close").await?;

        let report = run.meter(order.weight_grams).await?;

        run.release_gate().await?;

        run.motor(MotorCommand::MoveToCenter, "park-center").await?;
        run.motor(MotorCommand::GateClose, "park-gate").await?;

        tracing::info!(order_id = %order.order_id, grams = report.dispensed_grams, "order dispensed");
        Ok(report)
    }
}

/// One order's pass through the sequence
struct Run<'a> {
    dispenser: &'a Dispenser,
    order_id: &'a str,
    attempt: &'a str,
}

impl Run<'_> {
    async fn motor(&self, command: MotorCommand, step: &str) -> Result<()> {
        let step = format!("{}:{}:{step}", self.order_id, self.attempt);
        self.dispenser.motors.run(command, Some(&step)).await
    }

    async fn rotate(&self, rotations: f64, step: &str) -> Result<f64> {
        self.motor(MotorCommand::RotateRight { rotations }, step).await?;
        let weight = self.dispenser.hardware.current_weight().await?;
        tracing::debug!(order_id = %self.order_id, step, rotations, weight, "measured");
        Ok(weight)
    }

    async fn meter(&self, target: f64) -> Result<DispenseReport> {
        // Contact position engages the screw with the hopper
        self.motor(MotorCommand::MoveRight, "contact").await?;
        self.dispenser.hardware.tare_scale().await?;

        let weight_per_turn = self.rotate(1.0, "calibration").await?;
        if weight_per_turn <= 0.0 {
            return Err(Error::Calibration(
                "calibration turn moved no material".to_string(),
            ));
        }

        let initial_fraction = weight_per_turn / target;
        tracing::debug!(
            order_id = %self.order_id,
            weight_per_turn,
            percent = initial_fraction * 100.0,
            "calibrated"
        );

        let mut rotations = vec![1.0];
        let mut dispensed = weight_per_turn;
        for (i, phase) in build_phases(initial_fraction).into_iter().enumerate() {
            let remaining = target - dispensed;
            if remaining <= 0.0 {
                break;
            }
            let to_dispense = (target * phase).min(remaining);
            if to_dispense <= 0.0 {
                continue;
            }

            let turns = to_dispense / weight_per_turn;
            dispensed = self.rotate(turns, &format!("phase-{i}")).await?;
            rotations.push(turns);
        }

        Ok(DispenseReport {
            order_id: self.order_id.to_string(),
            target_grams: target,
            weight_per_turn,
            dispensed_grams: dispensed,
            rotations,
        })
    }

    async fn release_gate(&self) -> Result<()> {
        let DispenseConfig {
            gate_poll_interval,
            gate_poll_attempts,
            ..
        } = self.dispenser.config;

        self.motor(MotorCommand::GateOpen, "gate-open").await?;
        for attempt in 1..=gate_poll_attempts {
            tokio::time::sleep(gate_poll_interval).await;
            let weight = self.dispenser.hardware.current_weight().await?;
            if weight <= 0.0 {
                tracing::debug!(order_id = %self.order_id, attempt, "scale empty, closing gate");
                return self.motor(MotorCommand::GateClose, "gate-release").await;
            }
            tracing::debug!(order_id = %self.order_id, weight, attempt, gate_poll_attempts, "scale not empty yet");
        }

        Err(Error::GateRelease {
            attempts: gate_poll_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{Value, json};
    use tokio::time::Instant;

    use super::*;
    use crate::config::HardwareConfig;
    use crate::hardware::{GET_CURRENT_WEIGHT, Hardware, HardwareResponse, SimulatedHardware};

    /// Drives the simulation directly and records each movement
    struct Direct {
        hardware: HardwareClient,
        skip: Option<&'static str>,
        log: StdMutex<Vec<(MotorCommand, String)>>,
    }

    #[async_trait]
    impl MotorDriver for Direct {
        async fn run(&self, command: MotorCommand, step: Option<&str>) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .push((command, step.unwrap_or_default().to_string()));
            if self.skip == Some(command.wire_name()) {
                return Ok(());
            }
            self.hardware.execute(&command).await.map(|_| ())
        }
    }

    /// Scale that returns a fixed sequence of readings
    struct ScriptedScale {
        readings: StdMutex<VecDeque<f64>>,
        sent: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl Hardware for ScriptedScale {
        async fn send_command(&self, command: &str, _payload: Value) -> Result<HardwareResponse> {
            self.sent.lock().unwrap().push(command.to_string());
            if command != GET_CURRENT_WEIGHT {
                return Ok(HardwareResponse::ok(None));
            }
            let weight = self.readings.lock().unwrap().pop_front().unwrap_or(0.0);
            Ok(HardwareResponse::ok(Some(json!({ "weight": weight }))))
        }
    }

    fn setup(
        per_rotation: f64,
        skip: Option<&'static str>,
    ) -> (Dispenser, Arc<Direct>, Arc<SimulatedHardware>) {
        let sim = Arc::new(SimulatedHardware::new(HardwareConfig {
            weight_per_rotation: per_rotation,
            ..HardwareConfig::default()
        }));
        let hardware = HardwareClient::new(sim.clone());
        let driver = Arc::new(Direct {
            hardware: hardware.clone(),
            skip,
            log: StdMutex::new(Vec::new()),
        });
        let dispenser = Dispenser::new(
            driver.clone(),
            hardware,
            DispenseConfig::default(),
            Arc::new(Mutex::new(())),
        );
        (dispenser, driver, sim)
    }

    fn order(id: &str, grams: f64) -> OrderPayload {
        OrderPayload {
            order_id: id.into(),
            product_id: "rice".into(),
            hopper_id: "hopper-2".into(),
            weight_grams: grams,
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn phases_shrink_bulk_by_calibration() {
        let phases = build_phases(0.2);
        assert!(close(phases[0], 0.7));
        assert!(close(phases[1], 0.07) && close(phases[2], 0.02) && close(phases[3], 0.01));
        assert!(close(build_phases(1.5)[0], 0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn converges_on_target() {
        let (dispenser, driver, sim) = setup(50.0, None);
        let report = dispenser.dispense(&order("order-1", 250.0), "1").await.unwrap();

        let expected = [1.0, 3.5, 0.35, 0.1, 0.05];
        assert_eq!(report.rotations.len(), expected.len());
        for (got, want) in report.rotations.iter().zip(expected) {
            assert!(close(*got, want), "{got} != {want}");
        }
        assert!(close(report.weight_per_turn, 50.0));
        assert!(close(report.dispensed_grams, 250.0));

        let commands: Vec<&str> = driver
            .log
            .lock()
            .unwrap()
            .iter()
            .map(|(c, _)| c.wire_name())
            .collect();
        assert_eq!(
            commands,
            [
                "MOVE_A_HOME",
                "MOVE_X_HOME",
                "MOVE_Y_HOME",
                "MOVE_X_TO_CENTER",
                "MOVE_Y_TO_HOPPER",
                "MOVE_A_CLOSE",
                "MOVE_X_TO_RIGHT",
                "MOVE_Z_RIGHT_ROTATION",
                "MOVE_Z_RIGHT_ROTATION",
                "MOVE_Z_RIGHT_ROTATION",
                "MOVE_Z_RIGHT_ROTATION",
                "MOVE_Z_RIGHT_ROTATION",
                "MOVE_A_OPEN",
                "MOVE_A_CLOSE",
                "MOVE_X_TO_CENTER",
                "MOVE_A_CLOSE",
            ]
        );
        assert!(sim.history().contains(&"TARE_SCALE".to_string()));
        assert!(sim.weight().abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_steps_are_keyed_by_order() {
        let (dispenser, driver, _) = setup(50.0, None);
        dispenser.dispense(&order("order-7", 250.0), "1").await.unwrap();

        let steps: Vec<String> = driver
            .log
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c.is_incremental())
            .map(|(_, s)| s.clone())
            .collect();
        assert_eq!(
            steps,
            [
                "order-7:1:calibration",
                "order-7:1:phase-0",
                "order-7:1:phase-1",
                "order-7:1:phase-2",
                "order-7:1:phase-3",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn calibration_turn_exceeding_target_stops_early() {
        let (dispenser, _, _) = setup(50.0, None);
        let report = dispenser.dispense(&order("order-1", 40.0), "1").await.unwrap();
        assert_eq!(report.rotations.len(), 1);
        assert!(close(report.rotations[0], 1.0));
        assert!(close(report.dispensed_grams, 50.0));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_calibration_turn_aborts() {
        let (dispenser, driver, _) = setup(0.0, None);
        let err = dispenser
            .dispense(&order("order-1", 250.0), "1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Calibration(_)));

        let log = driver.log.lock().unwrap();
        assert!(!log.iter().any(|(c, _)| *c == MotorCommand::GateOpen));
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_gate_gives_up_with_gate_open() {
        let (dispenser, driver, _) = setup(50.0, Some("MOVE_A_OPEN"));
        let started = Instant::now();
        let err = dispenser
            .dispense(&order("order-1", 250.0), "1")
            .await
            .unwrap_err();

        assert!(matches!(err, Error::GateRelease { attempts: 5 }));
        assert!(started.elapsed() >= Duration::from_secs(10));
        let log = driver.log.lock().unwrap();
        assert_eq!(log.last().map(|(c, _)| *c), Some(MotorCommand::GateOpen));
    }

    #[tokio::test(start_paused = true)]
    async fn gate_closes_once_scale_reads_empty() {
        let scale = Arc::new(ScriptedScale {
            readings: StdMutex::new(VecDeque::from([12.0, 8.0, 3.0, 0.0])),
            sent: StdMutex::new(Vec::new()),
        });
        let hardware = HardwareClient::new(scale.clone());
        let driver = Arc::new(Direct {
            hardware: hardware.clone(),
            skip: None,
            log: StdMutex::new(Vec::new()),
        });
        let dispenser = Dispenser::new(
            driver.clone(),
            hardware,
            DispenseConfig::default(),
            Arc::new(Mutex::new(())),
        );
        let run = Run {
            dispenser: &dispenser,
            order_id: "order-1",
            attempt: "1",
        };

        let started = Instant::now();
        run.release_gate().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(8));

        assert_eq!(
            *scale.sent.lock().unwrap(),
            [
                "MOVE_A_OPEN",
                GET_CURRENT_WEIGHT,
                GET_CURRENT_WEIGHT,
                GET_CURRENT_WEIGHT,
                GET_CURRENT_WEIGHT,
                "MOVE_A_CLOSE",
            ]
        );
        let steps: Vec<String> = driver
            .log
            .lock()
            .unwrap()
            .iter()
            .map(|(_, s)| s.clone())
            .collect();
        assert_eq!(steps, ["order-1:1:gate-open", "order-1:1:gate-release"]);
    }

    #[tokio::test(start_paused = true)]
    async fn machine_lock_serializes_orders() {
        let (dispenser, driver, _) = setup(50.0, None);
        let first = order("order-a", 100.0);
        let second = order("order-b", 100.0);

        let (a, b) = tokio::join!(
            dispenser.dispense(&first, "1"),
            dispenser.dispense(&second, "1")
        );
        a.unwrap();
        b.unwrap();

        let owners: Vec<bool> = driver
            .log
            .lock()
            .unwrap()
            .iter()
            .map(|(_, step)| step.starts_with("order-a:"))
            .collect();
        let switches = owners.windows(2).filter(|w| w[0] != w[1]).count();
        assert_eq!(switches, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn movement_failure_aborts_sequence() {
        let (dispenser, driver, sim) = setup(50.0, None);
        sim.fail_next("MOVE_Y_TO_HOPPER", "hopper slot blocked");

        let err = dispenser
            .dispense(&order("order-1", 250.0), "1")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("hopper slot blocked"));
        assert_eq!(driver.log.lock().unwrap().len(), 5);
    }
}
