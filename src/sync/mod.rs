//! Offline operation queue.
//!
//! Operations are persisted by [`OperationStore`], scheduled and submitted by
//! [`OfflineQueue`], and re-triggered on reconnect by [`SyncTrigger`].

mod batch;
mod conflict;
mod device;
mod events;
mod metrics;
mod operation;
pub(crate) mod queue;
pub(crate) mod store;
mod trigger;

pub use batch::{
    partition, sort_for_submission, split_ready, BatchOperation, BatchRequest, BatchResponse,
    ConflictReport, OperationResult, ResultError,
};
pub use conflict::{merge_data, ConflictData, ConflictStore, Resolution};
pub use device::device_id;
pub use events::QueueEvent;
pub use metrics::{HealthPolicy, QueueHealth, QueueMetrics};
pub use operation::{
    NewOperation, OperationError, OperationStatus, OperationType, Priority, QueuedOperation,
};
pub use queue::{OfflineQueue, PassSummary, QueueOptions};
pub use store::{Lane, OperationStore};
pub use trigger::{Connectivity, SyncTrigger};
