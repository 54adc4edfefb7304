//! Database schema and migrations

use rusqlite::Connection;

use crate::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize the database schema
///
/// # Errors
///
/// Returns error if migration fails
pub fn init(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Controllers known to the backend, keyed by hardware-issued uuid
        CREATE TABLE IF NOT EXISTS devices (
            uuid TEXT PRIMARY KEY,
            ip TEXT,
            firmware_version TEXT NOT NULL,
            board_name TEXT NOT NULL,
            last_seen_online_at TEXT NOT NULL,
            last_ping_rtt_ms INTEGER,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_devices_last_seen ON devices(last_seen_online_at);

        -- Components attached to a controller
        CREATE TABLE IF NOT EXISTS peripherals (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_uuid TEXT NOT NULL REFERENCES devices(uuid),
            component_id TEXT NOT NULL,
            peripheral_type TEXT NOT NULL CHECK(peripheral_type IN ('LED')),
            config TEXT NOT NULL DEFAULT '{}',
            state TEXT,
            config_status TEXT NOT NULL DEFAULT 'unset'
                CHECK(config_status IN ('unset', 'applied', 'error')),
            config_error TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(device_uuid, component_id)
        );

        CREATE INDEX IF NOT EXISTS idx_peripherals_device ON peripherals(device_uuid);

        PRAGMA user_version = 1;
        ",
    )?;

    tracing::info!("migrated to schema v1");
    Ok(())
}

fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Durable job queues; rows are retained after completion
        CREATE TABLE IF NOT EXISTS jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            queue TEXT NOT NULL,
            name TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'waiting'
                CHECK(status IN ('waiting', 'active', 'completed', 'failed')),
            attempts INTEGER NOT NULL DEFAULT 0,
            result TEXT,
            error TEXT,
            dedup_key TEXT,
            incremental INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_queue_status ON jobs(queue, status, id);
        CREATE INDEX IF NOT EXISTS idx_jobs_dedup ON jobs(queue, dedup_key);

        PRAGMA user_version = 2;
        ",
    )?;

    tracing::info!("migrated to schema v2");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();
        init(&conn).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('devices', 'peripherals', 'jobs')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 3);
    }
}
