//! Granel Gateway - backend for bulk-material dispensing machines
//!
//! This library provides the core functionality for the granel backend:
//! - MQTT correlation with field controllers (ping, commands, configuration)
//! - Device presence and peripheral synchronization
//! - Durable order pipeline (intake, preparation, motor movements)
//! - Closed-loop dispensing against the scale
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Field controllers                   │
//! │      discovery  │  config  │  commands  │  ping      │
//! └────────────────────┬────────────────────────────────┘
//!                      │ MQTT
//! ┌────────────────────▼────────────────────────────────┐
//! │                  Granel Gateway                      │
//! │   Bridge  │  Devices  │  Peripherals  │  Queues     │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                  Machine                             │
//! │   X / Y / Z / A axes  │  Scale                      │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod daemon;
pub mod db;
pub mod devices;
pub mod error;
pub mod hardware;
pub mod motion;
pub mod mqtt;
pub mod orders;
pub mod peripherals;
pub mod queue;

pub use config::Config;
pub use daemon::Daemon;
pub use db::{DbConn, DbPool};
pub use error::{Error, Result};
