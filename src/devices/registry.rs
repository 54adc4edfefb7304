//! Persistent device registry with presence events

use chrono::{Duration, Utc};
use tokio::sync::broadcast;

use super::types::{DeviceEvent, DeviceInfo, HEARTBEAT_WINDOW};
use crate::db::{DbPool, DeviceRepo, NewDevice};
use crate::{Error, Result};

const EVENT_CAPACITY: usize = 64;

/// Registry of controllers known to the backend
#[derive(Clone)]
pub struct DeviceRegistry {
    repo: DeviceRepo,
    events: broadcast::Sender<DeviceEvent>,
}

impl DeviceRegistry {
    /// Create a registry over the given pool
    #[must_use]
    pub fn new(pool: DbPool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            repo: DeviceRepo::new(pool),
            events,
        }
    }

    /// Subscribe to presence events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    /// Record a discovery announcement
    ///
    /// A known device has its last-seen refreshed (and ip, when given). An
    /// unknown device is only created when both board name and firmware
    /// version are present.
    ///
    /// # Errors
    ///
    /// Returns `IncompleteDevice` for an unknown device lacking metadata, or a
    /// database error
    pub fn register(
        &self,
        uuid: &str,
        ip: Option<&str>,
        board_name: Option<&str>,
        firmware_version: Option<&str>,
    ) -> Result<DeviceInfo> {
        let now = Utc::now();

        if self.repo.touch(uuid, ip, now)? {
            let device = self
                .repo
                .find(uuid)?
                .ok_or_else(|| Error::DeviceNotFound(uuid.to_string()))?;
            let info = DeviceInfo::at(device, now);
            tracing::debug!(device = %uuid, "device heartbeat");
            self.emit(DeviceEvent::Updated(info.clone()));
            return Ok(info);
        }

        let (Some(board_name), Some(firmware_version)) = (board_name, firmware_version) else {
            tracing::warn!(
                device = %uuid,
                "ignoring discovery from unknown device without board name and firmware version"
            );
            return Err(Error::IncompleteDevice(uuid.to_string()));
        };

        let device = self.repo.create(&NewDevice {
            uuid,
            ip,
            firmware_version,
            board_name,
            seen_at: now,
        })?;
        let info = DeviceInfo::at(device, now);

        tracing::info!(device = %uuid, board = %board_name, firmware = %firmware_version, "device registered");
        self.emit(DeviceEvent::Connected(info.clone()));
        Ok(info)
    }

    /// Force a device offline by moving its last-seen just outside the window
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn mark_disconnected(&self, uuid: &str) -> Result<()> {
        let seen_at = Utc::now() - HEARTBEAT_WINDOW - Duration::seconds(1);

        if self.repo.touch(uuid, None, seen_at)? {
            tracing::info!(device = %uuid, "device disconnected");
            self.emit(DeviceEvent::Disconnected {
                uuid: uuid.to_string(),
            });
        } else {
            tracing::warn!(device = %uuid, "disconnect notice for unknown device");
        }
        Ok(())
    }

    /// Look up one device
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get(&self, uuid: &str) -> Result<Option<DeviceInfo>> {
        Ok(self.repo.find(uuid)?.map(DeviceInfo::from))
    }

    /// All devices, most recently seen first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list(&self) -> Result<Vec<DeviceInfo>> {
        let now = Utc::now();
        Ok(self
            .repo
            .list()?
            .into_iter()
            .map(|d| DeviceInfo::at(d, now))
            .collect())
    }

    /// Devices currently inside the heartbeat window
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list_online(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self.list()?.into_iter().filter(|d| d.online).collect())
    }

    /// Store the latest ping round-trip time; failures are only logged
    pub fn update_last_ping_rtt(&self, uuid: &str, rtt_ms: u64) {
        match self.repo.set_last_ping_rtt(uuid, rtt_ms) {
            Ok(true) => tracing::debug!(device = %uuid, rtt_ms, "ping rtt recorded"),
            Ok(false) => tracing::warn!(device = %uuid, "ping rtt for unknown device"),
            Err(e) => tracing::warn!(device = %uuid, error = %e, "failed to record ping rtt"),
        }
    }

    fn emit(&self, event: DeviceEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(init_memory().unwrap())
    }

    #[test]
    fn unknown_device_needs_metadata() {
        let registry = registry();

        let err = registry
            .register("dev-1", Some("10.0.0.2"), None, Some("1.0.0"))
            .unwrap_err();
        assert!(matches!(err, Error::IncompleteDevice(_)));
        assert!(registry.get("dev-1").unwrap().is_none());
    }

    #[test]
    fn register_then_heartbeat() {
        let registry = registry();
        let mut events = registry.subscribe();

        let info = registry
            .register("dev-1", Some("10.0.0.2"), Some("esp32"), Some("1.0.0"))
            .unwrap();
        assert!(info.online);
        assert!(matches!(events.try_recv().unwrap(), DeviceEvent::Connected(_)));

        // Known device: metadata no longer required, ip preserved
        let info = registry.register("dev-1", None, None, None).unwrap();
        assert_eq!(info.ip.as_deref(), Some("10.0.0.2"));
        assert!(matches!(events.try_recv().unwrap(), DeviceEvent::Updated(_)));
    }

    #[test]
    fn mark_disconnected_goes_offline() {
        let registry = registry();
        registry
            .register("dev-1", None, Some("esp32"), Some("1.0.0"))
            .unwrap();
        let mut events = registry.subscribe();

        registry.mark_disconnected("dev-1").unwrap();
        assert!(!registry.get("dev-1").unwrap().unwrap().online);
        assert!(registry.list_online().unwrap().is_empty());
        assert_eq!(events.try_recv().unwrap().uuid(), "dev-1");

        // Rediscovery brings it back
        registry.register("dev-1", None, None, None).unwrap();
        assert_eq!(registry.list_online().unwrap().len(), 1);
    }

    #[test]
    fn disconnect_unknown_is_not_an_error() {
        let registry = registry();
        registry.mark_disconnected("ghost").unwrap();
    }

    #[test]
    fn ping_rtt_is_best_effort() {
        let registry = registry();
        registry.update_last_ping_rtt("ghost", 5);

        registry
            .register("dev-1", None, Some("esp32"), Some("1.0.0"))
            .unwrap();
        registry.update_last_ping_rtt("dev-1", 17);
        assert_eq!(
            registry.get("dev-1").unwrap().unwrap().last_ping_rtt_ms,
            Some(17)
        );
    }
}
