//! Worker delivering queued peripheral commands

use std::sync::Arc;

use async_trait::async_trait;

use super::types::{LedCommand, PeripheralCommandJob};
use crate::db::{JobRecord, PeripheralType};
use crate::mqtt::MqttBridge;
use crate::queue::JobHandler;
use crate::{Error, Result};

/// Publishes each queued command and waits for the device's feedback
pub struct PeripheralCommandWorker {
    bridge: Arc<MqttBridge>,
}

impl PeripheralCommandWorker {
    #[must_use]
    pub const fn new(bridge: Arc<MqttBridge>) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl JobHandler for PeripheralCommandWorker {
    async fn handle(&self, job: &JobRecord) -> Result<Option<serde_json::Value>> {
        let command: PeripheralCommandJob = serde_json::from_value(job.payload.clone())?;

        match command.peripheral_type {
            PeripheralType::Led => {
                // Reject anything outside the LED vocabulary before it reaches the wire
                command.command.parse::<LedCommand>()?;
            }
        }

        let feedback = self
            .bridge
            .publish_command(
                &command.device_uuid,
                &command.component_id,
                &command.command,
                command.payload.clone(),
                None,
            )
            .await
            .map_err(|e| match e {
                Error::DeviceReported(message) => {
                    Error::DeviceReported(format!("peripheral command failed: {message}"))
                }
                other => other,
            })?;

        tracing::debug!(
            device = %command.device_uuid,
            component = %command.component_id,
            command = %command.command,
            "peripheral command acknowledged"
        );
        Ok(Some(serde_json::to_value(feedback)?))
    }
}
