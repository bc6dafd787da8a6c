//! `SQLite` database connection and operations.
//!
//! The database is stored at `~/.habitsync/habitsync.db` and contains tables for:
//! - Queued operations (domain sync lane and ad-hoc request lane)
//! - Open data conflicts
//! - Small key/value metadata such as the device identifier

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;

use crate::config::Paths;
use crate::error::SyncError;

use super::migrations;

/// Database connection wrapper.
///
/// The connection sits behind a mutex so one database can be shared by the
/// operation stores, the conflict store and the processing tasks.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open the database at the default location.
    ///
    /// Creates the database file and runs migrations if necessary.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrations fail.
    pub fn open() -> Result<Self, SyncError> {
        let paths = Paths::new()?;
        paths.ensure_dirs()?;
        Self::open_at(&paths.database)
    }

    /// Open the database at a specific path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrations fail.
    pub fn open_at(path: &Path) -> Result<Self, SyncError> {
        let conn = Connection::open(path).map_err(|e| {
            SyncError::Database(format!("Failed to open database {}: {e}", path.display()))
        })?;

        // WAL keeps readers from blocking the processing pass.
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .map_err(|e| SyncError::db("Failed to configure database", &e))?;

        Self::from_connection(conn)
    }

    /// Open an in-memory database.
    ///
    /// Used by tests and as the degraded fallback when the on-disk database
    /// is unavailable.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrations fail.
    pub fn open_in_memory() -> Result<Self, SyncError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| SyncError::db("Failed to open in-memory database", &e))?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| SyncError::db("Failed to enable foreign keys", &e))?;

        Self::from_connection(conn)
    }

    /// Open the database at `path`, falling back to memory if that fails.
    ///
    /// Returns the database and whether it is durable.
    ///
    /// # Errors
    ///
    /// Returns an error only if even the in-memory database cannot be created.
    pub fn open_or_memory(path: &Path) -> Result<(Self, bool), SyncError> {
        match Self::open_at(path) {
            Ok(db) => Ok((db, true)),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "persistent storage unavailable, operations will be kept in memory"
                );
                Ok((Self::open_in_memory()?, false))
            },
        }
    }

    fn from_connection(conn: Connection) -> Result<Self, SyncError> {
        migrations::run(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Get the current schema version.
    ///
    /// # Errors
    ///
    /// Returns an error if the version cannot be read.
    pub fn schema_version(&self) -> Result<i32, SyncError> {
        migrations::get_version(&*self.lock()?)
    }

    /// Run a closure with exclusive access to the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection lock is poisoned, or whatever the
    /// closure returns.
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, SyncError>,
    ) -> Result<T, SyncError> {
        let conn = self.lock()?;
        f(&conn)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, SyncError> {
        self.conn
            .lock()
            .map_err(|_| SyncError::Database("Database connection lock poisoned".to_string()))
    }

    /// Read a metadata value.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_meta(&self, key: &str) -> Result<Option<String>, SyncError> {
        self.with_connection(|conn| {
            match conn.query_row("SELECT value FROM meta WHERE key = ?1", [key], |row| {
                row.get(0)
            }) {
                Ok(value) => Ok(Some(value)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(SyncError::db("Failed to read metadata", &e)),
            }
        })
    }

    /// Write a metadata value.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn set_meta(&self, key: &str, value: &str) -> Result<(), SyncError> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO meta (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                [key, value],
            )
            .map_err(|e| SyncError::db("Failed to write metadata", &e))?;
            Ok(())
        })
    }
}
