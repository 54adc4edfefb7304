//! Durable job queues on the row store
//!
//! Jobs survive restarts, are never removed automatically, and are processed
//! by a [`WorkerPool`] per queue. Delivery is at-least-once: see
//! [`JobQueue::recover_stalled`] for how interrupted jobs are resolved.

mod job_queue;
mod worker;

pub use job_queue::{EnqueueOptions, JobOutcome, JobQueue};
pub use worker::{JobHandler, WorkerPool};

pub use crate::db::{JobCounts, JobRecord, JobStatus};

/// Order intake stage
pub const INTAKE_QUEUE: &str = "intake-orders";

/// Order preparation stage (runs the dispensing sequence)
pub const PREPARE_QUEUE: &str = "prepare-orders";

/// Individual motor movements
pub const MOTOR_QUEUE: &str = "motor-movements";

/// Peripheral commands (LEDs)
pub const PERIPHERAL_QUEUE: &str = "peripheral-commands";

/// Every queue the daemon serves
pub const ALL_QUEUES: [&str; 4] = [INTAKE_QUEUE, PREPARE_QUEUE, MOTOR_QUEUE, PERIPHERAL_QUEUE];
