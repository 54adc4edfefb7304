use async_trait::async_trait;
use serde_json::json;

use super::MotorJob;
use crate::Result;
use crate::db::JobRecord;
use crate::hardware::HardwareClient;
use crate::queue::JobHandler;

/// Executes motor jobs against the machine
pub struct MotorWorker {
    hardware: HardwareClient,
}

impl MotorWorker {
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(hardware: HardwareClient) -> Self {
        Self { hardware }
    }
}

#[async_trait]
impl JobHandler for MotorWorker {
    async fn handle(&self, job: &JobRecord) -> Result<Option<serde_json::Value>> {
        let MotorJob { command, step } = serde_json::from_value(job.payload.clone())?;
        tracing::debug!(job_id = job.id, %command, step = step.as_deref().unwrap_or("-"), "executing movement");

        let data = self.hardware.execute(&command).await?;
        Ok(Some(json!({
            "command": command.wire_name(),
            "data": data,
        })))
    }
}
