//! Device repository

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};

use super::{DbPool, connection, parse_datetime, timestamp};
use crate::Result;

const COLUMNS: &str = "uuid, ip, firmware_version, board_name, last_seen_online_at, \
                       last_ping_rtt_ms, created_at, updated_at";

/// A stored controller
#[derive(Debug, Clone)]
pub struct Device {
    pub uuid: String,
    pub ip: Option<String>,
    pub firmware_version: String,
    pub board_name: String,
    pub last_seen_online_at: DateTime<Utc>,
    pub last_ping_rtt_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields required to create a device row
#[derive(Debug, Clone)]
pub struct NewDevice<'a> {
    pub uuid: &'a str,
    pub ip: Option<&'a str>,
    pub firmware_version: &'a str,
    pub board_name: &'a str,
    pub seen_at: DateTime<Utc>,
}

/// Device repository
#[derive(Clone)]
pub struct DeviceRepo {
    pool: DbPool,
}

impl DeviceRepo {
    /// Create a new device repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Find a device by uuid
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find(&self, uuid: &str) -> Result<Option<Device>> {
        let conn = connection(&self.pool)?;
        let device = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM devices WHERE uuid = ?1"),
                [uuid],
                row_to_device,
            )
            .optional()?;
        Ok(device)
    }

    /// Insert a new device
    ///
    /// # Errors
    ///
    /// Returns error if the row cannot be inserted
    pub fn create(&self, device: &NewDevice<'_>) -> Result<Device> {
        let conn = connection(&self.pool)?;
        let now = Utc::now();

        conn.execute(
            "INSERT INTO devices (uuid, ip, firmware_version, board_name, last_seen_online_at, \
             created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                device.uuid,
                device.ip,
                device.firmware_version,
                device.board_name,
                timestamp(&device.seen_at),
                timestamp(&now),
            ],
        )?;

        Ok(Device {
            uuid: device.uuid.to_string(),
            ip: device.ip.map(String::from),
            firmware_version: device.firmware_version.to_string(),
            board_name: device.board_name.to_string(),
            last_seen_online_at: device.seen_at,
            last_ping_rtt_ms: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Refresh last-seen, and the ip when one is given
    ///
    /// Returns `false` when the device does not exist.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn touch(&self, uuid: &str, ip: Option<&str>, seen_at: DateTime<Utc>) -> Result<bool> {
        let conn = connection(&self.pool)?;
        let updated = conn.execute(
            "UPDATE devices SET last_seen_online_at = ?2, ip = COALESCE(?3, ip), updated_at = ?4 \
             WHERE uuid = ?1",
            params![uuid, timestamp(&seen_at), ip, timestamp(&Utc::now())],
        )?;
        Ok(updated > 0)
    }

    /// Record the round-trip time of the latest ping
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn set_last_ping_rtt(&self, uuid: &str, rtt_ms: u64) -> Result<bool> {
        let conn = connection(&self.pool)?;
        let updated = conn.execute(
            "UPDATE devices SET last_ping_rtt_ms = ?2, updated_at = ?3 WHERE uuid = ?1",
            params![
                uuid,
                i64::try_from(rtt_ms).unwrap_or(i64::MAX),
                timestamp(&Utc::now())
            ],
        )?;
        Ok(updated > 0)
    }

    /// List all devices, most recently seen first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list(&self) -> Result<Vec<Device>> {
        let conn = connection(&self.pool)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM devices ORDER BY last_seen_online_at DESC"
        ))?;

        let devices = stmt
            .query_map([], row_to_device)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(devices)
    }
}

fn row_to_device(row: &Row<'_>) -> rusqlite::Result<Device> {
    Ok(Device {
        uuid: row.get(0)?,
        ip: row.get(1)?,
        firmware_version: row.get(2)?,
        board_name: row.get(3)?,
        last_seen_online_at: parse_datetime(&row.get::<_, String>(4)?),
        last_ping_rtt_ms: row
            .get::<_, Option<i64>>(5)?
            .and_then(|v| u64::try_from(v).ok()),
        created_at: parse_datetime(&row.get::<_, String>(6)?),
        updated_at: parse_datetime(&row.get::<_, String>(7)?),
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::db::init_memory;

    fn setup() -> DeviceRepo {
        DeviceRepo::new(init_memory().unwrap())
    }

    fn new_device(uuid: &str, seen_at: DateTime<Utc>) -> NewDevice<'_> {
        NewDevice {
            uuid,
            ip: Some("10.0.0.5"),
            firmware_version: "1.2.0",
            board_name: "esp32",
            seen_at,
        }
    }

    #[test]
    fn test_create_and_find() {
        let repo = setup();
        repo.create(&new_device("dev-1", Utc::now())).unwrap();

        let device = repo.find("dev-1").unwrap().unwrap();
        assert_eq!(device.board_name, "esp32");
        assert_eq!(device.ip.as_deref(), Some("10.0.0.5"));
        assert!(device.last_ping_rtt_ms.is_none());

        assert!(repo.find("missing").unwrap().is_none());
    }

    #[test]
    fn test_touch_keeps_ip_when_absent() {
        let repo = setup();
        repo.create(&new_device("dev-1", Utc::now())).unwrap();

        assert!(repo.touch("dev-1", None, Utc::now()).unwrap());
        let device = repo.find("dev-1").unwrap().unwrap();
        assert_eq!(device.ip.as_deref(), Some("10.0.0.5"));

        assert!(repo.touch("dev-1", Some("10.0.0.9"), Utc::now()).unwrap());
        let device = repo.find("dev-1").unwrap().unwrap();
        assert_eq!(device.ip.as_deref(), Some("10.0.0.9"));

        assert!(!repo.touch("missing", None, Utc::now()).unwrap());
    }

    #[test]
    fn test_list_orders_by_last_seen() {
        let repo = setup();
        let now = Utc::now();
        repo.create(&new_device("old", now - Duration::minutes(10)))
            .unwrap();
        repo.create(&new_device("new", now)).unwrap();

        let uuids: Vec<_> = repo.list().unwrap().into_iter().map(|d| d.uuid).collect();
        assert_eq!(uuids, vec!["new", "old"]);
    }

    #[test]
    fn test_ping_rtt() {
        let repo = setup();
        repo.create(&new_device("dev-1", Utc::now())).unwrap();

        assert!(repo.set_last_ping_rtt("dev-1", 42).unwrap());
        assert_eq!(repo.find("dev-1").unwrap().unwrap().last_ping_rtt_ms, Some(42));
    }
}
