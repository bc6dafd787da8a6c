//! Configuration management for habitsync.
//!
//! This module handles loading configuration from `~/.habitsync/`.

mod paths;
mod settings;

pub use paths::{Paths, HOME_ENV};
pub use settings::{Config, GeneralConfig, QueueConfig, RecoveryConfig, ServerConfig};
