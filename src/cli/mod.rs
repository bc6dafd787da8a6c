//! Command-line interface for habitsync.

pub mod args;
pub mod commands;
