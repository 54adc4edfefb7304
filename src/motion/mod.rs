//! Motor movements
//!
//! Every movement runs as its own job on the motor queue so a single worker
//! owns the actuators. Callers go through a [`MotorDriver`].

mod command;
mod driver;
mod worker;

pub use command::{HomingAxis, MotorCommand};
pub use driver::{MotorDriver, QueuedMotorDriver};
pub use worker::MotorWorker;

use serde::{Deserialize, Serialize};

/// Job name used on the motor queue
pub const MOTOR_JOB: &str = "motor-command";

/// Payload of a motor queue job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MotorJob {
    pub command: MotorCommand,
    /// Order step this movement belongs to, for tracing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
}
