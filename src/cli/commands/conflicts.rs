//! Conflict command implementations.

use serde_json::json;

use super::queue::parse_json;
use crate::cli::args::{ConflictCommands, OutputFormat};
use crate::engine::SyncEngine;
use crate::error::SyncError;
use crate::output::{format_conflicts, to_json};

/// Execute conflict subcommands.
///
/// # Errors
///
/// Returns an error if the conflict is unknown, merge data is invalid, or
/// storage fails.
pub fn conflicts(
    engine: &SyncEngine,
    cmd: ConflictCommands,
    format: OutputFormat,
) -> Result<String, SyncError> {
    let queue = engine.queue();

    match cmd {
        ConflictCommands::List => format_conflicts(&queue.conflicts()?, format),
        ConflictCommands::Resolve {
            id,
            resolution,
            data,
        } => {
            let merged = data.as_deref().map(|raw| parse_json(raw, "--data")).transpose()?;
            let requeued = queue.resolve_conflict(&id, resolution, merged)?;

            match format {
                OutputFormat::Json => to_json(&json!({
                    "conflictId": id,
                    "resolution": resolution,
                    "requeued": requeued,
                })),
                OutputFormat::Pretty => Ok(requeued.map_or_else(
                    || format!("Resolved {id}: server version kept"),
                    |new_id| format!("Resolved {id} ({resolution}): resubmitting as {new_id}"),
                )),
            }
        },
        ConflictCommands::Auto => {
            let count = queue.auto_resolve_conflicts()?;

            match format {
                OutputFormat::Json => to_json(&json!({ "resolved": count })),
                OutputFormat::Pretty => {
                    Ok(format!("Resolved {count} conflicts in favour of the server"))
                },
            }
        },
    }
}
