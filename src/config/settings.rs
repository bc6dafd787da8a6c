//! Configuration settings for habitsync.
//!
//! Settings are loaded from `~/.habitsync/config.yaml`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cli::args::OutputFormat;
use crate::config::Paths;
use crate::error::SyncError;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// General settings.
    pub general: GeneralConfig,
    /// Sync server settings.
    pub server: ServerConfig,
    /// Offline queue settings.
    pub queue: QueueConfig,
    /// Error recovery settings.
    pub recovery: RecoveryConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Default output format.
    pub default_output: OutputFormat,
    /// Log filter used when `HABITSYNC_LOG` is not set.
    pub log_level: String,
}

/// Sync server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL every endpoint is resolved against.
    pub base_url: String,
    /// Endpoint receiving batched operations.
    pub batch_endpoint: String,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Bearer token attached to requests, if any.
    pub auth_token: Option<String>,
}

/// Offline queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Submit operations in batches instead of one request each.
    pub batching: bool,
    /// Operations per batch.
    pub batch_size: usize,
    /// Default retry budget per operation.
    pub max_retries: u32,
    /// Start a processing pass after enqueueing while online.
    pub auto_process: bool,
    /// Pending count above which the queue reports a warning.
    pub high_water_mark: usize,
    /// Age in minutes after which a pending operation is stale.
    pub stale_after_minutes: i64,
    /// Failed fraction above which the queue reports an error.
    pub failure_ratio_threshold: f64,
    /// Periodic processing interval in seconds; 0 disables the timer.
    pub sync_interval_secs: u64,
}

/// Error recovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Base delay for network backoff in milliseconds.
    pub network_base_delay_ms: u64,
    /// Upper bound for network backoff in milliseconds.
    pub network_max_delay_ms: u64,
    /// Upper bound for random jitter added to network backoff.
    pub network_jitter_ms: u64,
    /// Network retries before queueing offline.
    pub network_max_retries: u32,
    /// Server error retries before falling back.
    pub server_max_retries: u32,
    /// Linear step for server error retries in milliseconds.
    pub server_retry_delay_ms: u64,
    /// Rate-limit delays in seconds, indexed by retry count.
    pub rate_limit_schedule_secs: Vec<u64>,
    /// Attempts per ad-hoc offline request before it is dropped.
    pub offline_request_max_attempts: u32,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            default_output: OutputFormat::Pretty,
            log_level: "warn".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            batch_endpoint: "/sync/batch".to_string(),
            request_timeout_secs: 30,
            auth_token: None,
        }
    }
}

impl ServerConfig {
    /// Per-request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batching: true,
            batch_size: 5,
            max_retries: 3,
            auto_process: true,
            high_water_mark: 100,
            stale_after_minutes: 60,
            failure_ratio_threshold: 0.10,
            sync_interval_secs: 300,
        }
    }
}

impl QueueConfig {
    /// Periodic processing interval, if enabled.
    #[must_use]
    pub const fn sync_interval(&self) -> Option<Duration> {
        if self.sync_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.sync_interval_secs))
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            network_base_delay_ms: 1_000,
            network_max_delay_ms: 30_000,
            network_jitter_ms: 1_000,
            network_max_retries: 3,
            server_max_retries: 2,
            server_retry_delay_ms: 1_000,
            rate_limit_schedule_secs: vec![30, 60, 120, 300],
            offline_request_max_attempts: 3,
        }
    }
}

impl Config {
    /// Load configuration from the default path.
    ///
    /// If the config file doesn't exist, returns default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self, SyncError> {
        let paths = Paths::new()?;
        Self::load_from_path(&paths.config_file)
    }

    /// Load configuration from a specific path.
    ///
    /// If the config file doesn't exist, returns default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed, or
    /// if the parsed values are unusable.
    pub fn load_from_path(path: &std::path::Path) -> Result<Self, SyncError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!(
                "Failed to read config file {}: {e}",
                path.display()
            ))
        })?;

        let config: Self = serde_yaml::from_str(&contents).map_err(|e| {
            SyncError::Config(format!(
                "Failed to parse config file {}: {e}",
                path.display()
            ))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a specific path.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be written.
    pub fn save_to_path(&self, path: &std::path::Path) -> Result<(), SyncError> {
        let contents = serde_yaml::to_string(self)
            .map_err(|e| SyncError::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, contents).map_err(|e| {
            SyncError::Config(format!(
                "Failed to write config file {}: {e}",
                path.display()
            ))
        })
    }

    /// Reject values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Config` naming the offending field.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.queue.batch_size == 0 {
            return Err(SyncError::Config(
                "queue.batch_size must be at least 1".to_string(),
            ));
        }
        if self.recovery.rate_limit_schedule_secs.is_empty() {
            return Err(SyncError::Config(
                "recovery.rate_limit_schedule_secs must not be empty".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.queue.failure_ratio_threshold) {
            return Err(SyncError::Config(
                "queue.failure_ratio_threshold must be between 0 and 1".to_string(),
            ));
        }
        Ok(())
    }
}
