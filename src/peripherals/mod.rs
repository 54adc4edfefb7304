//! Peripheral configuration and commands
//!
//! [`PeripheralService`] keeps the stored peripheral set and the device in
//! step; [`PeripheralCommandWorker`] drains the command queue.

mod commands;
mod service;
mod types;

pub use commands::PeripheralCommandWorker;
pub use service::{PERIPHERAL_COMMAND_JOB, PeripheralService};
pub use types::{
    LedCommand, LedConfig, MAX_COMPONENT_ID_LEN, PeripheralCommandJob, normalize_config,
    validate_component_id,
};

pub use crate::db::{ConfigStatus, Peripheral, PeripheralType};
