//! Peripheral repository

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

use super::{DbPool, connection, parse_datetime, timestamp};
use crate::{Error, Result};

const COLUMNS: &str = "id, device_uuid, component_id, peripheral_type, config, state, \
                       config_status, config_error, created_at, updated_at";

/// Kind of component attached to a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeripheralType {
    #[serde(rename = "LED")]
    Led,
}

impl PeripheralType {
    /// Wire and storage name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Led => "LED",
        }
    }
}

impl fmt::Display for PeripheralType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PeripheralType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "LED" => Ok(Self::Led),
            other => Err(Error::Validation(format!("unknown peripheral type: {other}"))),
        }
    }
}

/// Whether the device confirmed the stored configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigStatus {
    Unset,
    Applied,
    Error,
}

impl ConfigStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unset => "unset",
            Self::Applied => "applied",
            Self::Error => "error",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "applied" => Self::Applied,
            "error" => Self::Error,
            _ => Self::Unset,
        }
    }
}

impl fmt::Display for ConfigStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored peripheral
#[derive(Debug, Clone)]
pub struct Peripheral {
    pub id: i64,
    pub device_uuid: String,
    pub component_id: String,
    pub peripheral_type: PeripheralType,
    pub config: serde_json::Value,
    pub state: Option<serde_json::Value>,
    pub config_status: ConfigStatus,
    pub config_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Peripheral repository
#[derive(Clone)]
pub struct PeripheralRepo {
    pool: DbPool,
}

impl PeripheralRepo {
    /// Create a new peripheral repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// All peripherals of a device, in creation order
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list_for_device(&self, device_uuid: &str) -> Result<Vec<Peripheral>> {
        let conn = connection(&self.pool)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM peripherals WHERE device_uuid = ?1 ORDER BY id"
        ))?;

        let peripherals = stmt
            .query_map([device_uuid], row_to_peripheral)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(peripherals)
    }

    /// Find one peripheral
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find(&self, device_uuid: &str, component_id: &str) -> Result<Option<Peripheral>> {
        let conn = connection(&self.pool)?;
        let peripheral = conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM peripherals WHERE device_uuid = ?1 AND component_id = ?2"
                ),
                [device_uuid, component_id],
                row_to_peripheral,
            )
            .optional()?;
        Ok(peripheral)
    }

    /// Insert a peripheral whose configuration the device already applied
    ///
    /// # Errors
    ///
    /// Returns error if the row exists or cannot be inserted
    pub fn create(
        &self,
        device_uuid: &str,
        component_id: &str,
        peripheral_type: PeripheralType,
        config: &serde_json::Value,
    ) -> Result<Peripheral> {
        let conn = connection(&self.pool)?;
        let now = timestamp(&Utc::now());

        conn.execute(
            "INSERT INTO peripherals (device_uuid, component_id, peripheral_type, config, \
             config_status, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, 'applied', ?5, ?5)",
            params![
                device_uuid,
                component_id,
                peripheral_type.as_str(),
                config.to_string(),
                now
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Error::AlreadyExists(format!("{device_uuid}/{component_id}"))
            }
            other => Error::Sqlite(other),
        })?;
        drop(conn);

        self.find(device_uuid, component_id)?
            .ok_or_else(|| Error::NotFound(format!("{device_uuid}/{component_id}")))
    }

    /// Replace the configuration of an existing peripheral
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the peripheral does not exist
    pub fn update_config(
        &self,
        device_uuid: &str,
        component_id: &str,
        config: &serde_json::Value,
    ) -> Result<Peripheral> {
        let conn = connection(&self.pool)?;
        let updated = conn.execute(
            "UPDATE peripherals SET config = ?3, config_status = 'applied', config_error = NULL, \
             updated_at = ?4 WHERE device_uuid = ?1 AND component_id = ?2",
            params![
                device_uuid,
                component_id,
                config.to_string(),
                timestamp(&Utc::now())
            ],
        )?;
        drop(conn);

        if updated == 0 {
            return Err(Error::NotFound(format!("{device_uuid}/{component_id}")));
        }

        self.find(device_uuid, component_id)?
            .ok_or_else(|| Error::NotFound(format!("{device_uuid}/{component_id}")))
    }

    /// Delete a peripheral
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn delete(&self, device_uuid: &str, component_id: &str) -> Result<bool> {
        let conn = connection(&self.pool)?;
        let deleted = conn.execute(
            "DELETE FROM peripherals WHERE device_uuid = ?1 AND component_id = ?2",
            [device_uuid, component_id],
        )?;
        Ok(deleted > 0)
    }

    /// Record the device's verdict on one peripheral
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn set_status(
        &self,
        device_uuid: &str,
        component_id: &str,
        status: ConfigStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        let conn = connection(&self.pool)?;
        let updated = conn.execute(
            "UPDATE peripherals SET config_status = ?3, config_error = ?4, updated_at = ?5 \
             WHERE device_uuid = ?1 AND component_id = ?2",
            params![
                device_uuid,
                component_id,
                status.as_str(),
                error,
                timestamp(&Utc::now())
            ],
        )?;
        Ok(updated > 0)
    }

    /// Mark every peripheral of a device as failed
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn mark_all_error(&self, device_uuid: &str, error: &str) -> Result<usize> {
        let conn = connection(&self.pool)?;
        let updated = conn.execute(
            "UPDATE peripherals SET config_status = 'error', config_error = ?2, updated_at = ?3 \
             WHERE device_uuid = ?1",
            params![device_uuid, error, timestamp(&Utc::now())],
        )?;
        Ok(updated)
    }
}

fn row_to_peripheral(row: &Row<'_>) -> rusqlite::Result<Peripheral> {
    let type_str: String = row.get(3)?;
    let config_str: String = row.get(4)?;
    let state_str: Option<String> = row.get(5)?;

    Ok(Peripheral {
        id: row.get(0)?,
        device_uuid: row.get(1)?,
        component_id: row.get(2)?,
        peripheral_type: type_str.parse().unwrap_or(PeripheralType::Led),
        config: serde_json::from_str(&config_str).unwrap_or(serde_json::Value::Null),
        state: state_str.and_then(|s| serde_json::from_str(&s).ok()),
        config_status: ConfigStatus::parse(&row.get::<_, String>(6)?),
        config_error: row.get(7)?,
        created_at: parse_datetime(&row.get::<_, String>(8)?),
        updated_at: parse_datetime(&row.get::<_, String>(9)?),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::db::{DeviceRepo, NewDevice, init_memory};

    fn setup() -> PeripheralRepo {
        let pool = init_memory().unwrap();
        DeviceRepo::new(pool.clone())
            .create(&NewDevice {
                uuid: "dev-1",
                ip: None,
                firmware_version: "1.0.0",
                board_name: "esp32",
                seen_at: Utc::now(),
            })
            .unwrap();
        PeripheralRepo::new(pool)
    }

    #[test]
    fn test_create_is_applied() {
        let repo = setup();
        let p = repo
            .create("dev-1", "led1", PeripheralType::Led, &json!({"pin": 2}))
            .unwrap();

        assert_eq!(p.config_status, ConfigStatus::Applied);
        assert_eq!(p.config, json!({"pin": 2}));

        let dup = repo.create("dev-1", "led1", PeripheralType::Led, &json!({"pin": 3}));
        assert!(matches!(dup, Err(Error::AlreadyExists(_))));
    }

    #[test]
    fn test_update_and_delete() {
        let repo = setup();
        repo.create("dev-1", "led1", PeripheralType::Led, &json!({"pin": 2}))
            .unwrap();

        let p = repo.update_config("dev-1", "led1", &json!({"pin": 4})).unwrap();
        assert_eq!(p.config["pin"], 4);

        assert!(matches!(
            repo.update_config("dev-1", "nope", &json!({"pin": 4})),
            Err(Error::NotFound(_))
        ));

        assert!(repo.delete("dev-1", "led1").unwrap());
        assert!(!repo.delete("dev-1", "led1").unwrap());
        assert!(repo.list_for_device("dev-1").unwrap().is_empty());
    }

    #[test]
    fn test_status_updates() {
        let repo = setup();
        repo.create("dev-1", "led1", PeripheralType::Led, &json!({"pin": 2}))
            .unwrap();
        repo.create("dev-1", "led2", PeripheralType::Led, &json!({"pin": 3}))
            .unwrap();

        repo.set_status("dev-1", "led1", ConfigStatus::Error, Some("bad pin"))
            .unwrap();
        let p = repo.find("dev-1", "led1").unwrap().unwrap();
        assert_eq!(p.config_status, ConfigStatus::Error);
        assert_eq!(p.config_error.as_deref(), Some("bad pin"));

        assert_eq!(repo.mark_all_error("dev-1", "boom").unwrap(), 2);
        assert!(
            repo.list_for_device("dev-1")
                .unwrap()
                .iter()
                .all(|p| p.config_status == ConfigStatus::Error)
        );
    }
}
