//! Queue command implementations.

use serde_json::{json, Value};

use crate::cli::args::{AddArgs, OutputFormat};
use crate::engine::SyncEngine;
use crate::error::SyncError;
use crate::output::{format_metrics, format_operations, format_run, to_json};
use crate::sync::{NewOperation, OperationStatus};

/// Show queue metrics and health.
///
/// # Errors
///
/// Returns an error if output formatting fails.
pub fn status(engine: &SyncEngine, format: OutputFormat) -> Result<String, SyncError> {
    let metrics = engine.queue().get_metrics();
    format_metrics(&metrics, engine.device_id(), engine.is_durable(), format)
}

/// List queued operations, optionally filtered by status.
///
/// # Errors
///
/// Returns an error if output formatting fails.
pub fn list(
    engine: &SyncEngine,
    status: Option<OperationStatus>,
    format: OutputFormat,
) -> Result<String, SyncError> {
    let operations = engine.queue().operations(status);
    let title = status.map_or_else(
        || "Operations".to_string(),
        |s| format!("{} Operations", capitalize(s.as_str())),
    );
    format_operations(&operations, &title, format)
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars).collect()
    })
}

/// Parse a JSON argument.
pub(super) fn parse_json(raw: &str, what: &str) -> Result<Value, SyncError> {
    serde_json::from_str(raw)
        .map_err(|e| SyncError::InvalidInput(format!("{what} is not valid JSON: {e}")))
}

/// Queue one operation.
///
/// # Errors
///
/// Returns an error if the payload is not JSON or the operation cannot be
/// stored.
pub fn add(engine: &SyncEngine, args: AddArgs, format: OutputFormat) -> Result<String, SyncError> {
    let mut operation = NewOperation::new(args.operation_type, args.endpoint).with_method(args.method);
    if let Some(raw) = args.data.as_deref() {
        operation = operation.with_data(parse_json(raw, "--data")?);
    }
    if let Some(priority) = args.priority {
        operation = operation.with_priority(priority);
    }
    for dependency in args.depends_on {
        operation = operation.depends_on(dependency);
    }

    let id = engine.queue().enqueue(operation)?;
    let op = engine
        .queue()
        .operation(&id)?
        .ok_or_else(|| SyncError::NotFound(format!("operation {id}")))?;

    match format {
        OutputFormat::Json => to_json(&op),
        OutputFormat::Pretty => Ok(format!(
            "Queued {} operation ({}, priority {})",
            op.operation_type, op.id, op.priority
        )),
    }
}

/// Run one processing pass and one offline request pass.
///
/// # Errors
///
/// Returns an error if output formatting fails.
pub async fn run(engine: &SyncEngine, format: OutputFormat) -> Result<String, SyncError> {
    let (pass, requests) = engine.sync_now().await;
    format_run(&pass, &requests, format)
}

/// Reset failed operations that have retries left.
///
/// # Errors
///
/// Returns an error if the reset fails.
pub fn retry(engine: &SyncEngine, format: OutputFormat) -> Result<String, SyncError> {
    let count = engine.queue().retry_failed_operations()?;

    match format {
        OutputFormat::Json => to_json(&json!({ "reset": count })),
        OutputFormat::Pretty => Ok(format!("Reset {count} failed operations for retry")),
    }
}

/// Remove completed operations, or everything with `all` and `force`.
///
/// # Errors
///
/// Returns an error if `all` is given without `force`, or the delete fails.
pub fn clear(
    engine: &SyncEngine,
    all: bool,
    force: bool,
    format: OutputFormat,
) -> Result<String, SyncError> {
    if all {
        if !force {
            return Err(SyncError::InvalidInput(
                "Use --force to clear all operations".to_string(),
            ));
        }
        engine.queue().clear_all()?;

        match format {
            OutputFormat::Json => to_json(&json!({ "cleared": "all" })),
            OutputFormat::Pretty => Ok("Cleared all operations and conflicts".to_string()),
        }
    } else {
        let count = engine.queue().clear_completed()?;

        match format {
            OutputFormat::Json => to_json(&json!({ "cleared": count })),
            OutputFormat::Pretty => Ok(format!("Cleared {count} completed operations")),
        }
    }
}

/// List requests saved for later delivery.
///
/// # Errors
///
/// Returns an error if output formatting fails.
pub fn requests(engine: &SyncEngine, format: OutputFormat) -> Result<String, SyncError> {
    format_operations(&engine.recovery().pending_requests(), "Offline Requests", format)
}

/// Print the device identifier.
///
/// # Errors
///
/// Returns an error if output formatting fails.
pub fn device(engine: &SyncEngine, format: OutputFormat) -> Result<String, SyncError> {
    match format {
        OutputFormat::Json => to_json(&json!({ "deviceId": engine.device_id() })),
        OutputFormat::Pretty => Ok(engine.device_id().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::Config;
    use crate::recovery::UnavailableRefresher;
    use crate::sync::queue::tests::ack_all;
    use crate::sync::{OperationType, Priority};
    use crate::transport::testing::ScriptedTransport;
    use crate::transport::HttpMethod;

    fn engine() -> SyncEngine {
        let mut config = Config::default();
        config.queue.auto_process = false;
        SyncEngine::in_memory(
            &config,
            Arc::new(ScriptedTransport::new(|_, r| ack_all(r))),
            Arc::new(UnavailableRefresher),
        )
        .unwrap()
    }

    fn add_args(data: Option<&str>) -> AddArgs {
        AddArgs {
            operation_type: OperationType::HabitToggle,
            endpoint: "/habits/h1/toggle".to_string(),
            method: HttpMethod::Post,
            data: data.map(str::to_string),
            priority: Some(Priority::Low),
            depends_on: Vec::new(),
        }
    }

    #[test]
    fn test_capitalize() {
        assert_eq!(capitalize("failed"), "Failed");
        assert_eq!(capitalize(""), "");
    }

    #[test]
    fn test_add_then_list() {
        let engine = engine();
        let output = add(&engine, add_args(Some(r#"{"completed":true}"#)), OutputFormat::Json).unwrap();
        let op: Value = serde_json::from_str(&output).unwrap();
        assert_eq!(op["priority"], "low");
        assert_eq!(op["data"]["completed"], true);

        let listed = list(&engine, Some(OperationStatus::Pending), OutputFormat::Json).unwrap();
        assert!(listed.contains("\"count\": 1"));
        assert!(listed.contains("Pending Operations"));
    }

    #[test]
    fn test_add_rejects_bad_json() {
        let err = add(&engine(), add_args(Some("{nope")), OutputFormat::Pretty).unwrap_err();
        assert!(matches!(err, SyncError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_run_reports_pass() {
        let engine = engine();
        add(&engine, add_args(None), OutputFormat::Pretty).unwrap();

        let output = run(&engine, OutputFormat::Json).await.unwrap();
        let summary: Value = serde_json::from_str(&output).unwrap();
        assert_eq!(summary["operations"]["processed"], 1);
        assert_eq!(summary["requests"]["sent"], 0);

        let cleared = clear(&engine, false, false, OutputFormat::Json).unwrap();
        assert!(cleared.contains("\"cleared\": 1"));
    }

    #[test]
    fn test_clear_all_requires_force() {
        let err = clear(&engine(), true, false, OutputFormat::Pretty).unwrap_err();
        assert!(err.to_string().contains("--force"));
    }

    #[test]
    fn test_device_json() {
        let engine = engine();
        let output = device(&engine, OutputFormat::Json).unwrap();
        assert!(output.contains(engine.device_id()));
    }
}
