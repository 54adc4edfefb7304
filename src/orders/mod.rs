//! Order pipeline: intake, preparation, dispensing

mod dispense;
mod intake;
mod prepare;

pub use dispense::{DispenseReport, Dispenser, build_phases};
pub use intake::IntakeWorker;
pub use prepare::PrepareWorker;

use serde::{Deserialize, Serialize};

use crate::queue::{JobQueue, JobRecord};
use crate::{Error, Result};

/// Job name used on the intake queue
pub const INTAKE_JOB: &str = "enqueue-order";

/// Job name used on the preparation queue
pub const PREPARE_JOB: &str = "prepare-order";

/// One order: a weight of one product taken from one hopper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPayload {
    pub order_id: String,
    pub product_id: String,
    pub hopper_id: String,
    pub weight_grams: f64,
}

impl OrderPayload {
    /// New order with a fresh id; the hopper defaults to `hopper-{product_id}`
    #[must_use]
    pub fn new(product_id: &str, weight_grams: f64, hopper_id: Option<&str>) -> Self {
        Self {
            order_id: uuid::Uuid::new_v4().to_string(),
            product_id: product_id.to_string(),
            hopper_id: hopper_id.map_or_else(|| format!("hopper-{product_id}"), str::to_string),
            weight_grams,
        }
    }

    /// Check the order can be dispensed
    ///
    /// # Errors
    ///
    /// Returns `Validation` for a non-positive or non-finite weight, an empty
    /// id, or a hopper id without a trailing slot number
    pub fn validate(&self) -> Result<()> {
        if !self.weight_grams.is_finite() || self.weight_grams <= 0.0 {
            return Err(Error::Validation(format!(
                "weight must be a positive number of grams, got {}",
                self.weight_grams
            )));
        }
        for (field, value) in [
            ("orderId", &self.order_id),
            ("productId", &self.product_id),
            ("hopperId", &self.hopper_id),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Validation(format!("{field} must not be empty")));
            }
        }
        hopper_index(&self.hopper_id).map(|_| ())
    }
}

/// Where an accepted order was queued
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderReceipt {
    pub queue: String,
    pub job_id: i64,
}

/// Slot number at the end of a hopper id (`hopper-3` is slot 3)
///
/// # Errors
///
/// Returns `Validation` if the id does not end in digits
pub fn hopper_index(hopper_id: &str) -> Result<u32> {
    let prefix = hopper_id.trim_end_matches(|c: char| c.is_ascii_digit());
    let digits = &hopper_id[prefix.len()..];
    digits.parse().map_err(|_| {
        Error::Validation(format!(
            "hopper id {hopper_id:?} does not end with a hopper number"
        ))
    })
}

/// Accept an order into the intake queue
///
/// # Errors
///
/// Returns `Validation` for an invalid order, or a queue error
pub fn enqueue_order(intake: &JobQueue, order: &OrderPayload) -> Result<OrderReceipt> {
    order.validate()?;
    let job: JobRecord = intake.enqueue(INTAKE_JOB, order)?;
    tracing::info!(order_id = %order.order_id, product = %order.product_id, grams = order.weight_grams, job_id = job.id, "order accepted");
    Ok(OrderReceipt {
        queue: intake.name().to_string(),
        job_id: job.id,
    })
}
