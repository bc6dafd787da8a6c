//! JSON output formatting for habitsync.

use serde::Serialize;
use serde_json::json;

use crate::error::SyncError;
use crate::sync::{ConflictData, QueuedOperation};

/// Format operations as JSON
///
/// # Errors
///
/// Returns `SyncError::Parse` if JSON serialization fails.
pub fn format_operations_json(
    operations: &[QueuedOperation],
    title: &str,
) -> Result<String, SyncError> {
    let output = json!({
        "list": title,
        "count": operations.len(),
        "items": operations
    });
    Ok(serde_json::to_string_pretty(&output)?)
}

/// Format conflicts as JSON
///
/// # Errors
///
/// Returns `SyncError::Parse` if JSON serialization fails.
pub fn format_conflicts_json(conflicts: &[ConflictData]) -> Result<String, SyncError> {
    let output = json!({
        "count": conflicts.len(),
        "items": conflicts
    });
    Ok(serde_json::to_string_pretty(&output)?)
}

/// Generic JSON formatter for any serializable type
///
/// # Errors
///
/// Returns `SyncError::Parse` if JSON serialization fails.
pub fn to_json<T: Serialize>(value: &T) -> Result<String, SyncError> {
    Ok(serde_json::to_string_pretty(value)?)
}
