//! Path resolution for habitsync configuration and data files.
//!
//! All habitsync data is stored in `~/.habitsync/` unless `HABITSYNC_HOME`
//! points somewhere else:
//! - `config.yaml` - Main configuration file
//! - `habitsync.db` - SQLite database for the operation queues and conflicts

use std::path::PathBuf;

use crate::error::SyncError;

/// Environment variable that overrides the data root.
pub const HOME_ENV: &str = "HABITSYNC_HOME";

/// Paths to habitsync configuration and data files.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Root directory: `~/.habitsync/`
    pub root: PathBuf,
    /// Config file: `~/.habitsync/config.yaml`
    pub config_file: PathBuf,
    /// Database file: `~/.habitsync/habitsync.db`
    pub database: PathBuf,
}

impl Paths {
    /// Resolve paths from `HABITSYNC_HOME`, or the user's home directory.
    ///
    /// # Errors
    ///
    /// Returns an error if neither variable is set.
    pub fn new() -> Result<Self, SyncError> {
        if let Ok(root) = std::env::var(HOME_ENV) {
            return Ok(Self::with_root(PathBuf::from(root)));
        }

        let home = std::env::var("HOME")
            .map_err(|_| SyncError::Config("Could not determine home directory".to_string()))?;

        Ok(Self::with_root(PathBuf::from(home).join(".habitsync")))
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: PathBuf) -> Self {
        Self {
            config_file: root.join("config.yaml"),
            database: root.join("habitsync.db"),
            root,
        }
    }

    /// Ensure the root directory exists.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn ensure_dirs(&self) -> Result<(), SyncError> {
        if !self.root.exists() {
            std::fs::create_dir_all(&self.root).map_err(|e| {
                SyncError::Config(format!(
                    "Failed to create directory {}: {e}",
                    self.root.display()
                ))
            })?;
        }

        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new().unwrap_or_else(|_| Self::with_root(PathBuf::from(".habitsync")))
    }
}
