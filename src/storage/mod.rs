//! Storage layer for habitsync.
//!
//! This module provides SQLite-based persistence for:
//! - Queued operations (domain sync queue and ad-hoc request queue)
//! - Conflicts awaiting resolution
//! - Device metadata

mod database;
mod migrations;

pub use database::Database;
