use async_trait::async_trait;

use super::{Dispenser, OrderPayload};
use crate::Result;
use crate::queue::{JobHandler, JobRecord};

/// Runs the dispensing sequence for each prepared order
pub struct PrepareWorker {
    dispenser: Dispenser,
}

impl PrepareWorker {
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(dispenser: Dispenser) -> Self {
        Self { dispenser }
    }
}

#[async_trait]
impl JobHandler for PrepareWorker {
    async fn handle(&self, job: &JobRecord) -> Result<Option<serde_json::Value>> {
        let order: OrderPayload = serde_json::from_value(job.payload.clone())?;
        order.validate()?;

        let attempt = format!("{}.{}", job.id, job.attempts);
        let report = self.dispenser.dispense(&order, &attempt).await?;
        Ok(Some(serde_json::to_value(report)?))
    }
}
