//! Batch wire format and scheduling helpers.
//!
//! A pass loads pending operations, orders them, drops the ones whose
//! dependencies are not satisfied yet and cuts the rest into batches.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::operation::{OperationStatus, QueuedOperation};

/// One operation inside a batch submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOperation {
    pub id: String,
    #[serde(rename = "type")]
    pub operation_type: String,
    pub entity: String,
    pub operation: String,
    pub data: Value,
    pub client_timestamp: String,
    pub retry_count: u32,
}

impl From<&QueuedOperation> for BatchOperation {
    fn from(op: &QueuedOperation) -> Self {
        Self {
            id: op.id.clone(),
            operation_type: op.operation_type.as_str().to_string(),
            entity: op.operation_type.entity().to_string(),
            operation: op.operation_type.action().to_string(),
            data: op.data.clone(),
            client_timestamp: op.timestamp.to_rfc3339(),
            retry_count: op.retry_count,
        }
    }
}

/// Body of a batch submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub operations: Vec<BatchOperation>,
    pub device_id: String,
}

impl BatchRequest {
    /// Build the submission for a batch of operations.
    #[must_use]
    pub fn new(batch: &[QueuedOperation], device_id: &str) -> Self {
        Self {
            operations: batch.iter().map(BatchOperation::from).collect(),
            device_id: device_id.to_string(),
        }
    }
}

/// Conflict details reported for one operation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictReport {
    #[serde(default)]
    pub server_data: Value,
    #[serde(default = "default_conflict_type")]
    pub conflict_type: String,
}

fn default_conflict_type() -> String {
    "update".to_string()
}

/// Error details reported for one operation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status_code: Option<u16>,
}

/// Server verdict for one submitted operation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    #[serde(default)]
    pub success: bool,
    pub operation_id: String,
    #[serde(default)]
    pub conflict: Option<ConflictReport>,
    #[serde(default)]
    pub error: Option<ResultError>,
}

/// Body of a batch reply.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BatchResponse {
    #[serde(default)]
    pub results: Vec<OperationResult>,
}

impl BatchResponse {
    /// Index results by operation id; reply order is not assumed.
    #[must_use]
    pub fn into_map(self) -> HashMap<String, OperationResult> {
        self.results
            .into_iter()
            .map(|r| (r.operation_id.clone(), r))
            .collect()
    }
}

/// Order operations by priority descending, then creation time ascending.
///
/// The sort is stable, so operations with identical priority and timestamp
/// keep their insertion order.
pub fn sort_for_submission(operations: &mut [QueuedOperation]) {
    operations.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.timestamp.cmp(&b.timestamp))
    });
}

/// Split sorted pending operations into those ready to submit this pass and
/// those held back by unmet dependencies.
///
/// A dependency is met when the referenced operation is completed, no longer
/// known to the store, or placed earlier in `sorted`. `known` maps every
/// stored operation id to its status.
///
/// Placement only plans the pass. The queue calls this again with live
/// statuses right before each request, so an operation is only sent once
/// its dependencies completed or travel ahead of it in the same request.
#[must_use]
pub fn split_ready(
    sorted: Vec<QueuedOperation>,
    known: &HashMap<String, OperationStatus>,
) -> (Vec<QueuedOperation>, Vec<QueuedOperation>) {
    let mut scheduled: HashSet<String> = HashSet::new();
    let mut ready = Vec::with_capacity(sorted.len());
    let mut blocked = Vec::new();

    for op in sorted {
        let satisfied = op.dependencies.iter().all(|dep| {
            scheduled.contains(dep)
                || matches!(known.get(dep), None | Some(OperationStatus::Completed))
        });
        if satisfied {
            scheduled.insert(op.id.clone());
            ready.push(op);
        } else {
            blocked.push(op);
        }
    }

    (ready, blocked)
}

/// Cut operations into consecutive batches of at most `size`.
///
/// `size` of zero is treated as one.
#[must_use]
pub fn partition(operations: Vec<QueuedOperation>, size: usize) -> Vec<Vec<QueuedOperation>> {
    let size = size.max(1);
    let mut batches = Vec::with_capacity(operations.len().div_ceil(size));
    let mut current = Vec::with_capacity(size);

    for op in operations {
        current.push(op);
        if current.len() == size {
            batches.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }

    batches
}
