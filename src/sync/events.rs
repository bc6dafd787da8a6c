//! Events published by the offline queue.

use serde::Serialize;

use super::conflict::{ConflictData, Resolution};
use super::operation::QueuedOperation;

/// Something observable happened to the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum QueueEvent {
    OperationQueued {
        operation: QueuedOperation,
    },
    #[serde(rename_all = "camelCase")]
    BatchQueued {
        group_id: String,
        operation_ids: Vec<String>,
    },
    ProcessingStarted {
        pending: usize,
    },
    #[serde(rename_all = "camelCase")]
    BatchSubmitted {
        operation_ids: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    OperationCompleted {
        operation_id: String,
    },
    OperationRetrying {
        operation: QueuedOperation,
    },
    /// The operation reached terminal `failed`.
    OperationFailed {
        operation: QueuedOperation,
    },
    ConflictDetected {
        conflict: ConflictData,
    },
    #[serde(rename_all = "camelCase")]
    ConflictResolved {
        conflict_id: String,
        resolution: Resolution,
        /// Id of the resubmitted operation, if any.
        requeued: Option<String>,
    },
    /// End of a pass, emitted even when the pass stopped early.
    ProcessingCompleted {
        processed: usize,
        failed: usize,
    },
    FailedReset {
        count: usize,
    },
}

impl QueueEvent {
    /// Kebab-case event name, e.g. `operation-failed`.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::OperationQueued { .. } => "operation-queued",
            Self::BatchQueued { .. } => "batch-queued",
            Self::ProcessingStarted { .. } => "processing-started",
            Self::BatchSubmitted { .. } => "batch-submitted",
            Self::OperationCompleted { .. } => "operation-completed",
            Self::OperationRetrying { .. } => "operation-retrying",
            Self::OperationFailed { .. } => "operation-failed",
            Self::ConflictDetected { .. } => "conflict-detected",
            Self::ConflictResolved { .. } => "conflict-resolved",
            Self::ProcessingCompleted { .. } => "processing-completed",
            Self::FailedReset { .. } => "failed-reset",
        }
    }
}
