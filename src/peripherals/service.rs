//! Two-phase peripheral synchronization
//!
//! Controllers always receive their complete peripheral set. A change is
//! computed against the stored set, pushed, and written to the store only
//! after the device acknowledged it.

use std::sync::Arc;

use async_trait::async_trait;

use super::types::{LedCommand, PeripheralCommandJob, normalize_config, validate_component_id};
use crate::db::{ConfigStatus, DbPool, JobRecord, Peripheral, PeripheralRepo, PeripheralType};
use crate::devices::DeviceRegistry;
use crate::mqtt::{
    ConfigFeedback, ConfigFeedbackHandler, FeedbackStatus, MqttBridge, PeripheralConfigEntry,
    PeripheralConfigSet,
};
use crate::queue::JobQueue;
use crate::{Error, Result};

/// Job name used on the peripheral command queue
pub const PERIPHERAL_COMMAND_JOB: &str = "peripheral-command";

/// Peripheral lifecycle and command entry point
#[derive(Clone)]
pub struct PeripheralService {
    repo: PeripheralRepo,
    registry: DeviceRegistry,
    bridge: Arc<MqttBridge>,
    commands: JobQueue,
}

impl PeripheralService {
    #[must_use]
    pub fn new(
        pool: DbPool,
        registry: DeviceRegistry,
        bridge: Arc<MqttBridge>,
        commands: JobQueue,
    ) -> Self {
        Self {
            repo: PeripheralRepo::new(pool),
            registry,
            bridge,
            commands,
        }
    }

    /// Stored peripherals of a device
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list(&self, device_uuid: &str) -> Result<Vec<Peripheral>> {
        self.repo.list_for_device(device_uuid)
    }

    /// Add a peripheral to a device
    ///
    /// # Errors
    ///
    /// Returns `Validation`, `DeviceNotFound`, `AlreadyExists`, any
    /// `publish_config` error, or `DeviceReported` if the device did not
    /// acknowledge the new component. The store is untouched on error.
    pub async fn create(
        &self,
        device_uuid: &str,
        component_id: &str,
        peripheral_type: PeripheralType,
        config: &serde_json::Value,
    ) -> Result<Peripheral> {
        validate_component_id(component_id)?;
        let config = normalize_config(peripheral_type, config)?;
        self.require_device(device_uuid)?;

        let existing = self.repo.list_for_device(device_uuid)?;
        if existing.iter().any(|p| p.component_id == component_id) {
            return Err(Error::AlreadyExists(format!(
                "peripheral {component_id} on {device_uuid}"
            )));
        }

        let mut set = to_config_set(&existing);
        set.peripherals.push(PeripheralConfigEntry {
            component_id: component_id.to_string(),
            peripheral_type,
            config: config.clone(),
        });

        let feedback = self.bridge.publish_config(device_uuid, &set, None).await?;
        require_applied(&feedback, component_id)?;

        let peripheral = self
            .repo
            .create(device_uuid, component_id, peripheral_type, &config)?;
        tracing::info!(device = %device_uuid, component = %component_id, kind = %peripheral_type, "peripheral created");
        Ok(peripheral)
    }

    /// Replace the configuration of a peripheral
    ///
    /// # Errors
    ///
    /// Returns `Validation`, `NotFound`, any `publish_config` error, or
    /// `DeviceReported` if the device did not acknowledge the component
    pub async fn update(
        &self,
        device_uuid: &str,
        component_id: &str,
        config: &serde_json::Value,
    ) -> Result<Peripheral> {
        validate_component_id(component_id)?;
        self.require_device(device_uuid)?;

        let existing = self.repo.list_for_device(device_uuid)?;
        let target = existing
            .iter()
            .find(|p| p.component_id == component_id)
            .ok_or_else(|| {
                Error::NotFound(format!("peripheral {component_id} on {device_uuid}"))
            })?;
        let config = normalize_config(target.peripheral_type, config)?;

        let mut set = to_config_set(&existing);
        for entry in &mut set.peripherals {
            if entry.component_id == component_id {
                entry.config = config.clone();
            }
        }

        let feedback = self.bridge.publish_config(device_uuid, &set, None).await?;
        require_applied(&feedback, component_id)?;

        let peripheral = self.repo.update_config(device_uuid, component_id, &config)?;
        tracing::info!(device = %device_uuid, component = %component_id, "peripheral updated");
        Ok(peripheral)
    }

    /// Remove a peripheral from a device
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, or any `publish_config` error; the row is kept
    /// unless the device reported overall success
    pub async fn delete(&self, device_uuid: &str, component_id: &str) -> Result<()> {
        let existing = self.repo.list_for_device(device_uuid)?;
        if !existing.iter().any(|p| p.component_id == component_id) {
            return Err(Error::NotFound(format!(
                "peripheral {component_id} on {device_uuid}"
            )));
        }

        let remaining: Vec<Peripheral> = existing
            .into_iter()
            .filter(|p| p.component_id != component_id)
            .collect();
        self.bridge
            .publish_config(device_uuid, &to_config_set(&remaining), None)
            .await?;

        self.repo.delete(device_uuid, component_id)?;
        tracing::info!(device = %device_uuid, component = %component_id, "peripheral deleted");
        Ok(())
    }

    /// Queue an LED command for asynchronous delivery
    ///
    /// # Errors
    ///
    /// Returns `DeviceNotFound` or `DeviceOffline` before anything is queued,
    /// `NotFound` for an unknown component, or a queue error
    pub fn send_command(
        &self,
        device_uuid: &str,
        component_id: &str,
        command: LedCommand,
    ) -> Result<JobRecord> {
        let device = self
            .registry
            .get(device_uuid)?
            .ok_or_else(|| Error::DeviceNotFound(device_uuid.to_string()))?;
        if !device.online {
            return Err(Error::DeviceOffline(device_uuid.to_string()));
        }

        let peripheral = self.repo.find(device_uuid, component_id)?.ok_or_else(|| {
            Error::NotFound(format!("peripheral {component_id} on {device_uuid}"))
        })?;

        let job = self.commands.enqueue(
            PERIPHERAL_COMMAND_JOB,
            &PeripheralCommandJob {
                device_uuid: device_uuid.to_string(),
                component_id: component_id.to_string(),
                peripheral_type: peripheral.peripheral_type,
                command: command.as_str().to_string(),
                payload: None,
            },
        )?;
        tracing::debug!(device = %device_uuid, component = %component_id, command = %command, job_id = job.id, "command queued");
        Ok(job)
    }

    /// Feedback consumer to install on the bridge
    #[must_use]
    pub fn feedback_handler(&self) -> Arc<dyn ConfigFeedbackHandler> {
        Arc::new(ConfigStatusUpdater {
            repo: self.repo.clone(),
        })
    }

    fn require_device(&self, device_uuid: &str) -> Result<()> {
        self.registry
            .get(device_uuid)?
            .map(|_| ())
            .ok_or_else(|| Error::DeviceNotFound(device_uuid.to_string()))
    }
}

fn to_config_set(peripherals: &[Peripheral]) -> PeripheralConfigSet {
    PeripheralConfigSet {
        peripherals: peripherals
            .iter()
            .map(|p| PeripheralConfigEntry {
                component_id: p.component_id.clone(),
                peripheral_type: p.peripheral_type,
                config: p.config.clone(),
            })
            .collect(),
    }
}

fn require_applied(feedback: &ConfigFeedback, component_id: &str) -> Result<()> {
    if feedback.applied(component_id) {
        return Ok(());
    }
    let message = feedback
        .entry(component_id)
        .and_then(|e| e.message.clone())
        .unwrap_or_else(|| format!("device did not acknowledge {component_id}"));
    Err(Error::DeviceReported(message))
}

/// Applies config feedback to stored peripheral status
struct ConfigStatusUpdater {
    repo: PeripheralRepo,
}

impl ConfigStatusUpdater {
    fn apply(&self, uuid: &str, feedback: &ConfigFeedback) -> Result<()> {
        let entries = feedback.peripherals.as_deref().unwrap_or_default();

        if entries.is_empty() {
            if feedback.status == FeedbackStatus::Error {
                let message = feedback
                    .message
                    .as_deref()
                    .unwrap_or("general configuration error");
                let marked = self.repo.mark_all_error(uuid, message)?;
                tracing::warn!(device = %uuid, marked, error = %message, "config rejected without detail");
            } else {
                tracing::debug!(device = %uuid, "config feedback without per-peripheral detail");
            }
            return Ok(());
        }

        for entry in entries {
            match entry.status {
                FeedbackStatus::Success => {
                    self.repo
                        .set_status(uuid, &entry.component_id, ConfigStatus::Applied, None)?;
                }
                FeedbackStatus::Error => {
                    let message = entry
                        .message
                        .as_deref()
                        .or(feedback.message.as_deref())
                        .unwrap_or("configuration failed");
                    self.repo.set_status(
                        uuid,
                        &entry.component_id,
                        ConfigStatus::Error,
                        Some(message),
                    )?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigFeedbackHandler for ConfigStatusUpdater {
    async fn on_config_feedback(&self, uuid: &str, feedback: &ConfigFeedback) {
        if let Err(e) = self.apply(uuid, feedback) {
            tracing::error!(device = %uuid, error = %e, "failed to apply config feedback");
        }
    }
}
