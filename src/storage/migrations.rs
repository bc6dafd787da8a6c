//! Database migrations for habitsync.
//!
//! Each migration is a function that upgrades the schema by one version.
//! Migrations are run automatically when the database is opened.

use rusqlite::Connection;

use crate::error::SyncError;

/// Current schema version.
const CURRENT_VERSION: i32 = 1;

/// Get the current schema version from the database.
///
/// Returns 0 if no version has been set (new database).
pub fn get_version(conn: &Connection) -> Result<i32, SyncError> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|e| SyncError::db("Failed to get schema version", &e))
}

/// Set the schema version in the database.
fn set_version(conn: &Connection, version: i32) -> Result<(), SyncError> {
    conn.execute_batch(&format!("PRAGMA user_version = {version};"))
        .map_err(|e| SyncError::db("Failed to set schema version", &e))
}

/// Run all pending migrations.
pub fn run(conn: &Connection) -> Result<(), SyncError> {
    let current = get_version(conn)?;

    if current >= CURRENT_VERSION {
        return Ok(());
    }

    for version in (current + 1)..=CURRENT_VERSION {
        run_migration(conn, version)?;
        set_version(conn, version)?;
    }

    Ok(())
}

fn run_migration(conn: &Connection, version: i32) -> Result<(), SyncError> {
    match version {
        1 => migrate_v1(conn),
        _ => Err(SyncError::Database(format!(
            "Unknown migration version: {version}"
        ))),
    }
}

/// Migration v1: Initial schema.
///
/// Creates tables for:
/// - `operations`: queued operations for both the `sync` and `requests` lanes
/// - `conflicts`: server-reported conflicts awaiting resolution
/// - `meta`: key/value metadata (device id)
fn migrate_v1(conn: &Connection) -> Result<(), SyncError> {
    conn.execute_batch(
        r"
        CREATE TABLE IF NOT EXISTS operations (
            id TEXT PRIMARY KEY,
            lane TEXT NOT NULL DEFAULT 'sync',
            operation_type TEXT NOT NULL,
            endpoint TEXT NOT NULL,
            method TEXT NOT NULL DEFAULT 'POST',
            data TEXT NOT NULL DEFAULT 'null',
            headers TEXT NOT NULL DEFAULT '{}',
            priority INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            status TEXT NOT NULL DEFAULT 'pending',
            last_attempt TEXT,
            error_code TEXT,
            error_message TEXT,
            error_status INTEGER,
            dependencies TEXT NOT NULL DEFAULT '[]',
            group_id TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_operations_lane_status
        ON operations(lane, status);

        CREATE TABLE IF NOT EXISTS conflicts (
            id TEXT PRIMARY KEY,
            server_data TEXT NOT NULL,
            client_data TEXT NOT NULL,
            conflict_type TEXT NOT NULL,
            detected_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        ",
    )
    .map_err(|e| SyncError::db("Migration v1 failed", &e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_v1() {
        let conn = Connection::open_in_memory().unwrap();

        run(&conn).unwrap();
        assert_eq!(get_version(&conn).unwrap(), CURRENT_VERSION);

        conn.execute(
            "INSERT INTO operations (id, operation_type, endpoint, created_at)
             VALUES ('op-1', 'habit-toggle', '/habits/1/toggle', '2024-01-01T10:00:00Z')",
            [],
        )
        .unwrap();

        conn.execute(
            "INSERT INTO conflicts (id, server_data, client_data, conflict_type, detected_at)
             VALUES ('op-1', '{}', '{}', 'update', '2024-01-01T10:00:00Z')",
            [],
        )
        .unwrap();

        let lane: String = conn
            .query_row("SELECT lane FROM operations WHERE id = 'op-1'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(lane, "sync");
    }

    #[test]
    fn test_migration_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        run(&conn).unwrap();
        run(&conn).unwrap();

        assert_eq!(get_version(&conn).unwrap(), CURRENT_VERSION);
    }

    #[test]
    fn test_get_version_new_database() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(get_version(&conn).unwrap(), 0);
    }
}
