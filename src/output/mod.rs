//! Output formatting for habitsync.
//!
//! Each formatter renders either colored text for terminals or JSON for
//! scripting, depending on [`OutputFormat`].

mod json;
mod pretty;

use crate::cli::args::OutputFormat;
use crate::error::SyncError;
use crate::recovery::OfflineRunSummary;
use crate::sync::{ConflictData, PassSummary, QueueMetrics, QueuedOperation};

pub use json::*;
pub use pretty::*;

/// Format queue metrics based on output format
///
/// # Errors
///
/// Returns `SyncError::Parse` if JSON serialization fails.
pub fn format_metrics(
    metrics: &QueueMetrics,
    device_id: &str,
    durable: bool,
    format: OutputFormat,
) -> Result<String, SyncError> {
    match format {
        OutputFormat::Pretty => Ok(format_metrics_pretty(metrics, device_id, durable)),
        OutputFormat::Json => to_json(metrics),
    }
}

/// Format operations based on output format
///
/// # Errors
///
/// Returns `SyncError::Parse` if JSON serialization fails.
pub fn format_operations(
    operations: &[QueuedOperation],
    title: &str,
    format: OutputFormat,
) -> Result<String, SyncError> {
    match format {
        OutputFormat::Pretty => Ok(format_operations_pretty(operations, title)),
        OutputFormat::Json => format_operations_json(operations, title),
    }
}

/// Format conflicts based on output format
///
/// # Errors
///
/// Returns `SyncError::Parse` if JSON serialization fails.
pub fn format_conflicts(
    conflicts: &[ConflictData],
    format: OutputFormat,
) -> Result<String, SyncError> {
    match format {
        OutputFormat::Pretty => Ok(format_conflicts_pretty(conflicts)),
        OutputFormat::Json => format_conflicts_json(conflicts),
    }
}

/// Format a sync run based on output format
///
/// # Errors
///
/// Returns `SyncError::Parse` if JSON serialization fails.
pub fn format_run(
    pass: &PassSummary,
    requests: &OfflineRunSummary,
    format: OutputFormat,
) -> Result<String, SyncError> {
    match format {
        OutputFormat::Pretty => Ok(format_run_pretty(pass, requests)),
        OutputFormat::Json => to_json(&serde_json::json!({
            "operations": pass,
            "requests": requests,
        })),
    }
}
