//! The offline operation queue.
//!
//! Accepts typed domain operations, persists them, and drives processing
//! passes that submit them to the server in priority order. One pass runs at
//! a time; concurrent requests for a pass return immediately.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch, Mutex};
use uuid::Uuid;

use super::batch::{
    partition, sort_for_submission, split_ready, BatchRequest, BatchResponse, OperationResult,
    ResultError,
};
use super::conflict::{merge_data, ConflictData, ConflictStore, Resolution};
use super::events::QueueEvent;
use super::metrics::{HealthPolicy, QueueMetrics};
use super::operation::{
    NewOperation, OperationError, OperationStatus, OperationType, Priority, QueuedOperation,
};
use super::store::OperationStore;
use super::trigger::Connectivity;
use crate::config::Config;
use crate::error::SyncError;
use crate::recovery::{
    classify, resolve_code, ErrorCode, ErrorRecovery, RecoveryAction, RecoveryContext,
};
use crate::transport::{self, ApiRequest, CancelSignal, Transport, TransportError};

const EVENT_CAPACITY: usize = 256;
/// Operations kept in memory while the store refuses writes.
const MAX_UNSAVED: usize = 1_000;
const RESOLUTION_HEADER: &str = "X-Conflict-Resolution";

/// Queue behaviour, usually derived from [`Config`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueueOptions {
    /// Submit through the batch endpoint rather than one request per operation.
    pub batching: bool,
    pub batch_size: usize,
    /// Default retry budget for new operations.
    pub max_retries: u32,
    /// Start a pass in the background after enqueueing.
    pub auto_process: bool,
    pub batch_endpoint: String,
    pub request_timeout: Duration,
    pub health: HealthPolicy,
}

impl QueueOptions {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            batching: config.queue.batching,
            batch_size: config.queue.batch_size,
            max_retries: config.queue.max_retries,
            auto_process: config.queue.auto_process,
            batch_endpoint: config.server.batch_endpoint.clone(),
            request_timeout: config.server.request_timeout(),
            health: HealthPolicy::from(&config.queue),
        }
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// What one processing pass did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PassSummary {
    /// Operations that reached `completed`.
    pub processed: usize,
    /// Operations that became terminally `failed`, conflicts included.
    pub failed: usize,
    /// Operations returned to `pending` for a later pass.
    pub retrying: usize,
    pub conflicts: usize,
    /// Operations held back by unmet dependencies or waiting to be persisted.
    pub deferred: usize,
    /// Requests sent to the server.
    pub requests: usize,
    /// The pass did not run: another was in progress or the queue is offline.
    pub skipped: bool,
    /// The pass was cancelled while a request was in flight.
    pub aborted: bool,
    /// Delay the recovery layer asked for before the next attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<RecoveryAction>,
}

impl PassSummary {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

pub struct OfflineQueue {
    store: OperationStore,
    conflicts: ConflictStore,
    recovery: Arc<ErrorRecovery>,
    transport: Arc<dyn Transport>,
    connectivity: Connectivity,
    device_id: String,
    options: QueueOptions,
    events: broadcast::Sender<QueueEvent>,
    processing: Mutex<()>,
    cancel: watch::Sender<u64>,
    unsaved: StdMutex<Vec<QueuedOperation>>,
}

impl OfflineQueue {
    /// Build a queue over its collaborators.
    ///
    /// Operations stranded in `syncing` by an interrupted pass are returned
    /// to `pending`.
    #[must_use]
    pub fn new(
        store: OperationStore,
        conflicts: ConflictStore,
        recovery: Arc<ErrorRecovery>,
        transport: Arc<dyn Transport>,
        connectivity: Connectivity,
        device_id: String,
        options: QueueOptions,
    ) -> Self {
        match store.recover_interrupted() {
            Ok(0) => {},
            Ok(count) => tracing::info!(count, "recovered operations from an interrupted pass"),
            Err(e) => tracing::warn!(error = %e, "could not recover interrupted operations"),
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (cancel, _) = watch::channel(0);
        Self {
            store,
            conflicts,
            recovery,
            transport,
            connectivity,
            device_id,
            options,
            events,
            processing: Mutex::new(()),
            cancel,
            unsaved: StdMutex::new(Vec::new()),
        }
    }

    /// Receive every event published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    #[must_use]
    pub const fn options(&self) -> &QueueOptions {
        &self.options
    }

    /// Whether a pass is running right now.
    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.processing.try_lock().is_err()
    }

    fn emit(&self, event: QueueEvent) {
        tracing::trace!(event = event.name(), "queue event");
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Queue one operation and return its id.
    ///
    /// When the store rejects the write the operation is kept in memory and
    /// persisted by a later pass.
    ///
    /// # Errors
    ///
    /// Returns an error if the operation can neither be stored nor held.
    pub fn enqueue(self: &Arc<Self>, operation: NewOperation) -> Result<String, SyncError> {
        let op = self.insert(operation, None)?;
        self.maybe_process();
        Ok(op.id)
    }

    /// Queue several operations under one group id.
    ///
    /// # Errors
    ///
    /// Returns an error if an operation can neither be stored nor held.
    /// Operations accepted before the failure stay queued.
    pub fn enqueue_batch(
        self: &Arc<Self>,
        operations: Vec<NewOperation>,
    ) -> Result<Vec<String>, SyncError> {
        let group_id = format!("grp_{}", Uuid::new_v4().simple());
        let mut ids = Vec::with_capacity(operations.len());
        for operation in operations {
            ids.push(self.insert(operation, Some(&group_id))?.id);
        }

        self.emit(QueueEvent::BatchQueued {
            group_id,
            operation_ids: ids.clone(),
        });
        self.maybe_process();
        Ok(ids)
    }

    fn insert(
        &self,
        operation: NewOperation,
        group_id: Option<&str>,
    ) -> Result<QueuedOperation, SyncError> {
        let op = QueuedOperation {
            id: format!("op_{}", Uuid::new_v4().simple()),
            operation_type: operation.operation_type,
            endpoint: operation.endpoint,
            method: operation.method,
            data: operation.data,
            headers: operation.headers,
            priority: operation.priority,
            timestamp: Utc::now(),
            retry_count: 0,
            max_retries: operation.max_retries.unwrap_or(self.options.max_retries),
            status: OperationStatus::Pending,
            last_attempt: None,
            error: None,
            dependencies: operation.dependencies,
            group_id: group_id.map(str::to_string),
        };
        if let Err(e) = self.store.add(&op) {
            let mut unsaved = self.unsaved();
            if unsaved.len() >= MAX_UNSAVED {
                return Err(e);
            }
            tracing::warn!(
                operation_id = %op.id,
                error = %e,
                "could not persist operation, holding it in memory"
            );
            unsaved.push(op.clone());
        }

        tracing::debug!(
            operation_id = %op.id,
            kind = %op.operation_type,
            priority = %op.priority,
            "operation queued"
        );
        self.emit(QueueEvent::OperationQueued {
            operation: op.clone(),
        });
        Ok(op)
    }

    fn unsaved(&self) -> MutexGuard<'_, Vec<QueuedOperation>> {
        self.unsaved.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write operations held in memory to the store, keeping any it still
    /// rejects. Returns how many remain held.
    fn persist_unsaved(&self) -> usize {
        let mut unsaved = self.unsaved();
        if unsaved.is_empty() {
            return 0;
        }

        let before = unsaved.len();
        unsaved.retain(|op| self.store.add(op).is_err());
        let saved = before - unsaved.len();
        if saved > 0 {
            tracing::info!(saved, "held operations persisted");
        }
        if !unsaved.is_empty() {
            tracing::warn!(held = unsaved.len(), "store still rejects writes");
        }
        unsaved.len()
    }

    /// Stored operations followed by the ones held in memory.
    fn all_operations(&self) -> Vec<QueuedOperation> {
        let mut all = self.store.all();
        all.extend(self.unsaved().iter().cloned());
        all
    }

    fn statuses(&self) -> HashMap<String, OperationStatus> {
        self.all_operations()
            .into_iter()
            .map(|op| (op.id, op.status))
            .collect()
    }

    /// Check dependencies against live statuses right before a request.
    ///
    /// Earlier requests in the pass may have left a parent pending or
    /// failed; its dependents wait for a later pass.
    fn hold_unmet(
        &self,
        batch: Vec<QueuedOperation>,
        summary: &mut PassSummary,
    ) -> Vec<QueuedOperation> {
        if batch.iter().all(|op| op.dependencies.is_empty()) {
            return batch;
        }
        let (ready, held) = split_ready(batch, &self.statuses());
        if !held.is_empty() {
            tracing::debug!(held = held.len(), "dependencies did not complete earlier in the pass");
            summary.deferred += held.len();
        }
        ready
    }

    /// Start a background pass if enabled, online and idle.
    fn maybe_process(self: &Arc<Self>) {
        if !self.options.auto_process || !self.connectivity.is_online() || self.is_processing() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let queue = Arc::clone(self);
        runtime.spawn(async move {
            queue.process_queue().await;
        });
    }

    /// Run one processing pass.
    ///
    /// Does nothing when a pass is already running or the queue is offline.
    /// Never fails: every problem is recorded on the affected operations and
    /// reflected in the returned summary.
    pub async fn process_queue(&self) -> PassSummary {
        let Ok(_guard) = self.processing.try_lock() else {
            tracing::debug!("processing pass already running");
            return PassSummary::skipped();
        };
        let held = self.persist_unsaved();
        if !self.connectivity.is_online() {
            tracing::debug!("offline, processing deferred");
            return PassSummary::skipped();
        }

        let mut cancel = self.cancel.subscribe();
        let mut pending = self.store.get_pending();
        sort_for_submission(&mut pending);
        let (ready, blocked) = split_ready(pending, &self.statuses());

        let mut summary = PassSummary {
            deferred: blocked.len() + held,
            ..PassSummary::default()
        };
        if !blocked.is_empty() {
            tracing::debug!(deferred = blocked.len(), "operations waiting on dependencies");
        }
        self.emit(QueueEvent::ProcessingStarted {
            pending: ready.len(),
        });

        if self.options.batching {
            for batch in partition(ready, self.options.batch_size) {
                if !self.connectivity.is_online() {
                    break;
                }
                let batch = self.hold_unmet(batch, &mut summary);
                if batch.is_empty() {
                    continue;
                }
                if self.submit_batch(batch, &mut cancel, &mut summary).await == Flow::Stop {
                    break;
                }
            }
        } else {
            for op in ready {
                if !self.connectivity.is_online() {
                    break;
                }
                let Some(op) = self.hold_unmet(vec![op], &mut summary).pop() else {
                    continue;
                };
                if self.submit_direct(op, &mut cancel, &mut summary).await == Flow::Stop {
                    break;
                }
            }
        }

        tracing::info!(
            processed = summary.processed,
            failed = summary.failed,
            retrying = summary.retrying,
            aborted = summary.aborted,
            "processing pass finished"
        );
        self.emit(QueueEvent::ProcessingCompleted {
            processed: summary.processed,
            failed: summary.failed,
        });
        summary
    }

    /// Cancel the request in flight, if any.
    ///
    /// Operations already completed in the pass stay completed; the ones in
    /// the cancelled request return to pending without using a retry.
    pub fn abort_processing(&self) {
        self.cancel.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    fn mark_syncing(&self, batch: Vec<QueuedOperation>) -> Vec<QueuedOperation> {
        batch
            .into_iter()
            .filter_map(|op| {
                match self.store.update_status(&op.id, OperationStatus::Syncing, false) {
                    Ok(updated) => Some(updated),
                    Err(e) => {
                        tracing::warn!(operation_id = %op.id, error = %e, "skipping operation");
                        None
                    },
                }
            })
            .collect()
    }

    async fn submit_batch(
        &self,
        batch: Vec<QueuedOperation>,
        cancel: &mut CancelSignal,
        summary: &mut PassSummary,
    ) -> Flow {
        let batch = self.mark_syncing(batch);
        if batch.is_empty() {
            return Flow::Continue;
        }

        let body = match serde_json::to_value(BatchRequest::new(&batch, &self.device_id)) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(error = %e, "could not encode batch");
                self.revert(&batch);
                return Flow::Stop;
            },
        };
        let request = ApiRequest::post(self.options.batch_endpoint.clone(), body);

        self.emit(QueueEvent::BatchSubmitted {
            operation_ids: batch.iter().map(|op| op.id.clone()).collect(),
        });
        tracing::debug!(batch_size = batch.len(), "submitting batch");
        summary.requests += 1;

        let reply = transport::send(
            self.transport.as_ref(),
            &request,
            self.options.request_timeout,
            Some(cancel),
        )
        .await;

        match reply {
            Ok(response) => {
                self.apply_results(&batch, response.body, summary);
                Flow::Continue
            },
            Err(TransportError::Aborted) => {
                tracing::info!(batch_size = batch.len(), "batch aborted");
                self.revert(&batch);
                summary.aborted = true;
                Flow::Stop
            },
            Err(e) => {
                self.batch_failed(&batch, &e, summary).await;
                Flow::Stop
            },
        }
    }

    fn apply_results(&self, batch: &[QueuedOperation], body: Value, summary: &mut PassSummary) {
        let mut results = match serde_json::from_value::<BatchResponse>(body) {
            Ok(response) => response.into_map(),
            Err(e) => {
                tracing::warn!(error = %e, "unreadable batch response");
                HashMap::new()
            },
        };

        for op in batch {
            match results.remove(&op.id) {
                Some(OperationResult { success: true, .. }) => self.complete(op, summary),
                Some(OperationResult {
                    conflict: Some(conflict),
                    ..
                }) => self.conflict(op, conflict.server_data, conflict.conflict_type, summary),
                Some(OperationResult { error, .. }) => {
                    let error = error.unwrap_or_else(|| ResultError {
                        code: None,
                        message: "operation rejected without detail".to_string(),
                        status_code: None,
                    });
                    let code = resolve_code(error.code.as_deref(), error.status_code, &error.message);
                    self.apply_retry_policy(
                        op,
                        code,
                        OperationError {
                            code: code.as_str().to_string(),
                            message: error.message,
                            status_code: error.status_code,
                        },
                        summary,
                    );
                },
                None => self.apply_retry_policy(
                    op,
                    ErrorCode::ServerError,
                    OperationError {
                        code: ErrorCode::ServerError.as_str().to_string(),
                        message: "no result returned for operation".to_string(),
                        status_code: None,
                    },
                    summary,
                ),
            }
        }
    }

    async fn batch_failed(
        &self,
        batch: &[QueuedOperation],
        error: &TransportError,
        summary: &mut PassSummary,
    ) {
        let ui = classify(error);
        let attempts = batch.iter().map(|op| op.retry_count).max().unwrap_or(0);
        let verdict = self
            .recovery
            .handle_classified(&ui, &RecoveryContext::new("batch sync", attempts))
            .await;

        tracing::warn!(
            code = %ui.code,
            batch_size = batch.len(),
            action = %verdict.action,
            "batch submission failed"
        );

        let op_error = OperationError {
            code: ui.code.as_str().to_string(),
            message: ui.technical_message.clone(),
            status_code: ui.status_code,
        };
        for op in batch {
            self.apply_retry_policy(op, ui.code, op_error.clone(), summary);
        }
        summary.retry_after = verdict.retry_after;
        summary.action = Some(verdict.action);
    }

    async fn submit_direct(
        &self,
        op: QueuedOperation,
        cancel: &mut CancelSignal,
        summary: &mut PassSummary,
    ) -> Flow {
        let Some(op) = self.mark_syncing(vec![op]).pop() else {
            return Flow::Continue;
        };
        summary.requests += 1;

        let reply = transport::send(
            self.transport.as_ref(),
            &op.to_request(),
            self.options.request_timeout,
            Some(cancel),
        )
        .await;

        match reply {
            Ok(_) => self.complete(&op, summary),
            Err(TransportError::Aborted) => {
                self.revert(std::slice::from_ref(&op));
                summary.aborted = true;
                return Flow::Stop;
            },
            Err(TransportError::Http {
                status: 409, body, ..
            }) => {
                let server_data = body.get("serverData").cloned().unwrap_or_else(|| body.clone());
                let conflict_type = body
                    .get("conflictType")
                    .and_then(Value::as_str)
                    .unwrap_or("update")
                    .to_string();
                self.conflict(&op, server_data, conflict_type, summary);
            },
            Err(e) => {
                let ui = classify(&e);
                let verdict = self
                    .recovery
                    .handle_classified(&ui, &RecoveryContext::new(op.endpoint.clone(), op.retry_count))
                    .await;
                self.apply_retry_policy(
                    &op,
                    ui.code,
                    OperationError {
                        code: ui.code.as_str().to_string(),
                        message: ui.technical_message.clone(),
                        status_code: ui.status_code,
                    },
                    summary,
                );
                summary.retry_after = verdict.retry_after;
                summary.action = Some(verdict.action);
                // Transient failures affect everything behind this operation too.
                if ui.retryable {
                    return Flow::Stop;
                }
            },
        }
        Flow::Continue
    }

    fn complete(&self, op: &QueuedOperation, summary: &mut PassSummary) {
        match self.store.update_status(&op.id, OperationStatus::Completed, false) {
            Ok(_) => {
                summary.processed += 1;
                self.emit(QueueEvent::OperationCompleted {
                    operation_id: op.id.clone(),
                });
            },
            Err(e) => tracing::warn!(operation_id = %op.id, error = %e, "could not complete operation"),
        }
    }

    /// Consume one retry; fail terminally when the budget is spent or the
    /// error cannot be fixed by retrying.
    fn apply_retry_policy(
        &self,
        op: &QueuedOperation,
        code: ErrorCode,
        error: OperationError,
        summary: &mut PassSummary,
    ) {
        if let Err(e) = self.store.record_error(&op.id, &error) {
            tracing::warn!(operation_id = %op.id, error = %e, "could not record operation error");
        }

        let exhausted = op.retry_count + 1 >= op.max_retries;
        let next = if exhausted || !code.is_retryable() {
            OperationStatus::Failed
        } else {
            OperationStatus::Pending
        };

        match self.store.update_status(&op.id, next, true) {
            Ok(updated) if next == OperationStatus::Failed => {
                tracing::warn!(
                    operation_id = %op.id,
                    code = %code,
                    retry_count = updated.retry_count,
                    "operation failed"
                );
                summary.failed += 1;
                self.emit(QueueEvent::OperationFailed { operation: updated });
            },
            Ok(updated) => {
                tracing::debug!(operation_id = %op.id, code = %code, "operation will be retried");
                summary.retrying += 1;
                self.emit(QueueEvent::OperationRetrying { operation: updated });
            },
            Err(e) => tracing::warn!(operation_id = %op.id, error = %e, "could not update operation"),
        }
    }

    /// Record a server-reported conflict; the operation fails until resolved.
    fn conflict(
        &self,
        op: &QueuedOperation,
        server_data: Value,
        conflict_type: String,
        summary: &mut PassSummary,
    ) {
        let conflict = ConflictData {
            id: op.id.clone(),
            server_data,
            client_data: op.data.clone(),
            conflict_type,
            detected_at: Utc::now(),
        };
        if let Err(e) = self.conflicts.insert(&conflict) {
            tracing::warn!(operation_id = %op.id, error = %e, "could not record conflict");
        }

        let error = OperationError {
            code: ErrorCode::Conflict.as_str().to_string(),
            message: format!("{} conflict", conflict.conflict_type),
            status_code: Some(409),
        };
        if let Err(e) = self.store.record_error(&op.id, &error) {
            tracing::warn!(operation_id = %op.id, error = %e, "could not record operation error");
        }
        if let Err(e) = self.store.update_status(&op.id, OperationStatus::Failed, false) {
            tracing::warn!(operation_id = %op.id, error = %e, "could not fail conflicted operation");
        }

        tracing::info!(operation_id = %op.id, kind = %conflict.conflict_type, "conflict detected");
        summary.conflicts += 1;
        summary.failed += 1;
        self.emit(QueueEvent::ConflictDetected { conflict });
    }

    fn revert(&self, batch: &[QueuedOperation]) {
        for op in batch {
            if let Err(e) = self.store.update_status(&op.id, OperationStatus::Pending, false) {
                tracing::warn!(operation_id = %op.id, error = %e, "could not return operation to pending");
            }
        }
    }

    /// Reset failed operations with retry budget left, then try them again.
    ///
    /// # Errors
    ///
    /// Returns an error if the reset fails.
    pub fn retry_failed_operations(self: &Arc<Self>) -> Result<usize, SyncError> {
        let count = self.store.reset_failed()?;
        tracing::info!(count, "failed operations reset");
        self.emit(QueueEvent::FailedReset { count });
        if count > 0 {
            self.maybe_process();
        }
        Ok(count)
    }

    /// Delete completed operations.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn clear_completed(&self) -> Result<usize, SyncError> {
        self.store.remove_by_status(OperationStatus::Completed)
    }

    /// Delete every operation and conflict.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn clear_all(&self) -> Result<(), SyncError> {
        self.unsaved().clear();
        self.store.clear()?;
        self.conflicts.clear()
    }

    #[must_use]
    pub fn get_metrics(&self) -> QueueMetrics {
        QueueMetrics::compute(&self.all_operations(), &self.options.health, Utc::now())
    }

    /// Queued operations, optionally filtered by status, in insertion order.
    /// Operations held in memory come last.
    #[must_use]
    pub fn operations(&self, status: Option<OperationStatus>) -> Vec<QueuedOperation> {
        match status {
            None => self.all_operations(),
            Some(status) => {
                let mut ops = self.store.get_by_status(status);
                ops.extend(self.unsaved().iter().filter(|op| op.status == status).cloned());
                ops
            },
        }
    }

    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    pub fn operation(&self, id: &str) -> Result<Option<QueuedOperation>, SyncError> {
        if let Some(op) = self.unsaved().iter().find(|op| op.id == id) {
            return Ok(Some(op.clone()));
        }
        self.store.get(id)
    }

    /// Open conflicts in detection order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn conflicts(&self) -> Result<Vec<ConflictData>, SyncError> {
        self.conflicts.list()
    }

    /// Settle a conflict.
    ///
    /// `Server` drops the local change. `Client` and `Merge` queue a new
    /// high-priority operation carrying the local or merged data and return
    /// its id. The conflicted operation is removed in every case.
    ///
    /// Operations that depended on the conflicted one wait for the new
    /// operation instead. After `Server` their dependency is dropped and they
    /// apply on top of the server's version.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown conflict, `InvalidInput` when a merge needs
    /// explicit data, or a storage error.
    pub fn resolve_conflict(
        self: &Arc<Self>,
        conflict_id: &str,
        resolution: Resolution,
        merged: Option<Value>,
    ) -> Result<Option<String>, SyncError> {
        let conflict = self
            .conflicts
            .get(conflict_id)?
            .ok_or_else(|| SyncError::NotFound(format!("conflict {conflict_id}")))?;

        let data = match resolution {
            Resolution::Server => None,
            Resolution::Client => Some(conflict.client_data.clone()),
            Resolution::Merge => Some(match merged {
                Some(data) => data,
                None => merge_data(&conflict.server_data, &conflict.client_data)?,
            }),
        };

        let requeued = match data {
            Some(data) => {
                let original = self.store.get(conflict_id)?;
                Some(self.insert(resubmission(&conflict, original.as_ref(), data, resolution), None)?.id)
            },
            None => None,
        };

        let rewired = self.store.replace_dependency(conflict_id, requeued.as_deref())?;
        if rewired > 0 {
            tracing::debug!(conflict_id, rewired, "dependents moved off the conflicted operation");
        }
        self.conflicts.remove(conflict_id)?;
        self.store.remove(conflict_id)?;

        tracing::info!(
            conflict_id,
            %resolution,
            requeued = requeued.as_deref().unwrap_or("-"),
            "conflict resolved"
        );
        self.emit(QueueEvent::ConflictResolved {
            conflict_id: conflict_id.to_string(),
            resolution,
            requeued: requeued.clone(),
        });
        if requeued.is_some() {
            self.maybe_process();
        }
        Ok(requeued)
    }

    /// Resolve every open conflict in favour of the server, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if a conflict cannot be resolved; conflicts resolved
    /// before the failure stay resolved.
    pub fn auto_resolve_conflicts(self: &Arc<Self>) -> Result<usize, SyncError> {
        let open = self.conflicts.list()?;
        for conflict in &open {
            self.resolve_conflict(&conflict.id, Resolution::Server, None)?;
        }
        Ok(open.len())
    }
}

/// The operation that re-sends a conflicted change.
fn resubmission(
    conflict: &ConflictData,
    original: Option<&QueuedOperation>,
    data: Value,
    resolution: Resolution,
) -> NewOperation {
    let mut operation = match original {
        Some(op) => {
            let mut next = NewOperation::new(op.operation_type, op.endpoint.clone())
                .with_method(op.method)
                .with_max_retries(op.max_retries);
            next.headers = op.headers.clone();
            next
        },
        // The original was cleared; fall back to a generic request.
        None => NewOperation::new(OperationType::Request, format!("/conflicts/{}", conflict.id)),
    };
    operation.data = data;
    operation.priority = Priority::High;
    operation.with_header(RESOLUTION_HEADER, resolution.header_value())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::config::RecoveryConfig;
    use crate::recovery::{
        default_strategies, MockTokenRefresher, RefreshGate, TokenRefresher, UnavailableRefresher,
    };
    use crate::storage::Database;
    use crate::sync::store::Lane;
    use crate::transport::testing::ScriptedTransport;
    use crate::transport::ApiResponse;

    pub(crate) struct Harness {
        pub queue: Arc<OfflineQueue>,
        pub recovery: Arc<ErrorRecovery>,
        pub transport: Arc<ScriptedTransport>,
        pub connectivity: Connectivity,
    }

    pub(crate) fn test_options() -> QueueOptions {
        QueueOptions {
            auto_process: false,
            ..QueueOptions::default()
        }
    }

    pub(crate) fn harness_on(
        db: Arc<Database>,
        transport: ScriptedTransport,
        refresher: Arc<dyn TokenRefresher>,
        options: QueueOptions,
        online: bool,
    ) -> Harness {
        let transport = Arc::new(transport);
        let config = RecoveryConfig {
            network_jitter_ms: 0,
            ..RecoveryConfig::default()
        };
        let gate = Arc::new(RefreshGate::new(refresher));
        let recovery = Arc::new(ErrorRecovery::new(
            default_strategies(&config, gate),
            OperationStore::new(Arc::clone(&db), Lane::Requests),
            transport.clone(),
            Duration::from_secs(5),
            config.offline_request_max_attempts,
        ));
        let connectivity = Connectivity::new(online);
        let queue = Arc::new(OfflineQueue::new(
            OperationStore::new(Arc::clone(&db), Lane::Sync),
            ConflictStore::new(Arc::clone(&db)),
            Arc::clone(&recovery),
            transport.clone(),
            connectivity.clone(),
            "device-test".to_string(),
            options,
        ));
        Harness {
            queue,
            recovery,
            transport,
            connectivity,
        }
    }

    pub(crate) fn harness(transport: ScriptedTransport) -> Harness {
        harness_on(
            Arc::new(Database::open_in_memory().unwrap()),
            transport,
            Arc::new(UnavailableRefresher),
            test_options(),
            true,
        )
    }

    pub(crate) fn submitted_ids(request: &ApiRequest) -> Vec<String> {
        request
            .body
            .as_ref()
            .and_then(|body| body["operations"].as_array())
            .map(|ops| {
                ops.iter()
                    .filter_map(|op| op["id"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Acknowledge every operation in a batch.
    pub(crate) fn ack_all(request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let results: Vec<Value> = submitted_ids(request)
            .into_iter()
            .map(|id| json!({"success": true, "operationId": id}))
            .collect();
        Ok(ApiResponse::new(200, json!({ "results": results })))
    }

    fn toggle(habit: &str) -> NewOperation {
        NewOperation::habit_toggle(habit, "2024-06-01", true).with_priority(Priority::Normal)
    }

    fn drain(rx: &mut broadcast::Receiver<QueueEvent>) -> Vec<QueueEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_enqueue_assigns_fields_and_emits() {
        let h = harness(ScriptedTransport::new(|_, r| ack_all(r)));
        let mut rx = h.queue.subscribe();

        let id = h.queue.enqueue(toggle("h1")).unwrap();
        let op = h.queue.operation(&id).unwrap().unwrap();
        assert!(id.starts_with("op_"));
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.retry_count, 0);
        assert_eq!(op.max_retries, 3);

        let events = drain(&mut rx);
        assert!(matches!(&events[0], QueueEvent::OperationQueued { operation } if operation.id == id));
    }

    #[tokio::test]
    async fn test_enqueue_batch_shares_group() {
        let h = harness(ScriptedTransport::new(|_, r| ack_all(r)));
        let mut rx = h.queue.subscribe();

        let ids = h.queue.enqueue_batch(vec![toggle("a"), toggle("b")]).unwrap();
        let groups: Vec<_> = ids
            .iter()
            .map(|id| h.queue.operation(id).unwrap().unwrap().group_id)
            .collect();
        assert!(groups[0].is_some());
        assert_eq!(groups[0], groups[1]);

        let events = drain(&mut rx);
        assert!(matches!(events.last(), Some(QueueEvent::BatchQueued { operation_ids, .. }) if *operation_ids == ids));
    }

    #[tokio::test]
    async fn test_eight_operations_make_two_batches() {
        let h = harness(ScriptedTransport::new(|_, r| ack_all(r)));
        let ids: Vec<_> = (0..8)
            .map(|i| h.queue.enqueue(toggle(&format!("h{i}"))).unwrap())
            .collect();

        let summary = h.queue.process_queue().await;
        assert_eq!(summary.processed, 8);

        let requests = h.transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(submitted_ids(&requests[0]), ids[..5].to_vec());
        assert_eq!(submitted_ids(&requests[1]), ids[5..].to_vec());
        assert_eq!(requests[0].endpoint, "/sync/batch");
        assert_eq!(requests[0].body.as_ref().unwrap()["deviceId"], "device-test");
    }

    #[tokio::test]
    async fn test_priority_order_within_pass() {
        let h = harness(ScriptedTransport::new(|_, r| ack_all(r)));
        let low = h.queue.enqueue(toggle("low").with_priority(Priority::Low)).unwrap();
        let critical = h
            .queue
            .enqueue(toggle("critical").with_priority(Priority::Critical))
            .unwrap();
        let normal = h.queue.enqueue(toggle("normal")).unwrap();

        h.queue.process_queue().await;
        assert_eq!(
            submitted_ids(&h.transport.requests()[0]),
            vec![critical, normal, low]
        );
    }

    #[tokio::test]
    async fn test_concurrent_passes_collapse() {
        let h = harness(
            ScriptedTransport::new(|_, r| ack_all(r)).with_delay(Duration::from_millis(50)),
        );
        h.queue.enqueue(toggle("a")).unwrap();

        let (first, second) = tokio::join!(h.queue.process_queue(), h.queue.process_queue());
        assert!(first.skipped ^ second.skipped);
        assert_eq!(h.transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_offline_pass_is_noop() {
        let h = harness(ScriptedTransport::new(|_, r| ack_all(r)));
        h.queue.enqueue(toggle("a")).unwrap();
        h.connectivity.set_online(false);

        let summary = h.queue.process_queue().await;
        assert!(summary.skipped);
        assert_eq!(h.transport.call_count(), 0);
        assert_eq!(h.queue.get_metrics().pending_operations, 1);
    }

    #[tokio::test]
    async fn test_session_expiry_refreshes_and_completes() {
        let mut refresher = MockTokenRefresher::new();
        refresher.expect_refresh().times(2).returning(|| Ok(()));
        let transport = ScriptedTransport::new(|index, request| {
            if index < 2 {
                Ok(ApiResponse::new(
                    401,
                    json!({"error": {"code": "SESSION_EXPIRED", "message": "Session expired"}}),
                ))
            } else {
                ack_all(request)
            }
        });
        let h = harness_on(
            Arc::new(Database::open_in_memory().unwrap()),
            transport,
            Arc::new(refresher),
            test_options(),
            true,
        );
        let id = h.queue.enqueue(toggle("a")).unwrap();

        for _ in 0..2 {
            let summary = h.queue.process_queue().await;
            assert_eq!(summary.retrying, 1);
            assert_eq!(summary.action, Some(RecoveryAction::Retry));
        }
        let summary = h.queue.process_queue().await;
        assert_eq!(summary.processed, 1);

        let op = h.queue.operation(&id).unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Completed);
        assert_eq!(op.retry_count, 2);
        assert!(op.error.is_none());
    }

    #[tokio::test]
    async fn test_network_failures_exhaust_budget() {
        let h = harness(ScriptedTransport::new(|_, _| {
            Err(TransportError::Connection("connection refused".to_string()))
        }));
        let mut rx = h.queue.subscribe();
        let id = h.queue.enqueue(toggle("a")).unwrap();

        for _ in 0..3 {
            h.queue.process_queue().await;
        }

        let failed: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                QueueEvent::OperationFailed { operation } => Some(operation),
                _ => None,
            })
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, id);
        assert_eq!(failed[0].status, OperationStatus::Failed);
        assert_eq!(failed[0].retry_count, failed[0].max_retries);
        assert_eq!(failed[0].error.as_ref().unwrap().code, "CONNECTION_FAILED");

        // A fourth pass has nothing to send.
        h.queue.process_queue().await;
        assert_eq!(h.transport.call_count(), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_result_fails_immediately() {
        let h = harness(ScriptedTransport::new(|_, request| {
            let id = submitted_ids(request).remove(0);
            Ok(ApiResponse::new(
                200,
                json!({"results": [{"success": false, "operationId": id,
                    "error": {"code": "VALIDATION_ERROR", "message": "date required", "statusCode": 422}}]}),
            ))
        }));
        let id = h.queue.enqueue(toggle("a")).unwrap();

        let summary = h.queue.process_queue().await;
        assert_eq!(summary.failed, 1);
        let op = h.queue.operation(&id).unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.retry_count, 1);
        assert_eq!(op.error.unwrap().status_code, Some(422));
    }

    #[tokio::test]
    async fn test_missing_result_is_retried() {
        let h = harness(ScriptedTransport::new(|_, _| {
            Ok(ApiResponse::new(200, json!({"results": []})))
        }));
        let id = h.queue.enqueue(toggle("a")).unwrap();

        let summary = h.queue.process_queue().await;
        assert_eq!(summary.retrying, 1);
        let op = h.queue.operation(&id).unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.error.unwrap().code, "SERVER_ERROR");
    }

    #[tokio::test]
    async fn test_results_matched_by_id_not_position() {
        let h = harness(ScriptedTransport::new(|_, request| {
            let mut ids = submitted_ids(request);
            ids.reverse();
            let results: Vec<_> = ids
                .iter()
                .enumerate()
                .map(|(i, id)| {
                    if i == 0 {
                        json!({"success": false, "operationId": id,
                            "error": {"code": "NOT_FOUND", "message": "gone"}})
                    } else {
                        json!({"success": true, "operationId": id})
                    }
                })
                .collect();
            Ok(ApiResponse::new(200, json!({ "results": results })))
        }));
        let first = h.queue.enqueue(toggle("a")).unwrap();
        let second = h.queue.enqueue(toggle("b")).unwrap();

        h.queue.process_queue().await;
        let status = |id: &str| h.queue.operation(id).unwrap().unwrap().status;
        assert_eq!(status(&first), OperationStatus::Completed);
        assert_eq!(status(&second), OperationStatus::Failed);
    }

    #[tokio::test]
    async fn test_conflict_then_server_wins() {
        let h = harness(ScriptedTransport::new(|_, request| {
            let id = submitted_ids(request).remove(0);
            Ok(ApiResponse::new(
                200,
                json!({"results": [{"success": false, "operationId": id,
                    "conflict": {"serverData": {"completed": false}, "conflictType": "update"}}]}),
            ))
        }));
        let mut rx = h.queue.subscribe();
        let id = h.queue.enqueue(toggle("a")).unwrap();

        let summary = h.queue.process_queue().await;
        assert_eq!(summary.conflicts, 1);
        assert_eq!(
            h.queue.operation(&id).unwrap().unwrap().status,
            OperationStatus::Failed
        );
        let detected = drain(&mut rx).into_iter().find_map(|e| match e {
            QueueEvent::ConflictDetected { conflict } => Some(conflict),
            _ => None,
        });
        let detected = detected.unwrap();
        assert_eq!(detected.id, id);
        assert_eq!(detected.server_data, json!({"completed": false}));

        // Conflicted operations are not picked up by retry-all.
        assert_eq!(h.queue.retry_failed_operations().unwrap(), 0);

        let requeued = h.queue.resolve_conflict(&id, Resolution::Server, None).unwrap();
        assert!(requeued.is_none());
        assert!(h.queue.conflicts().unwrap().is_empty());
        assert!(h.queue.operations(None).is_empty());
    }

    #[tokio::test]
    async fn test_client_and_merge_resolutions_requeue() {
        let h = harness(ScriptedTransport::new(|_, request| {
            let results: Vec<_> = submitted_ids(request)
                .into_iter()
                .map(|id| json!({"success": false, "operationId": id,
                    "conflict": {"serverData": {"note": "server", "streak": 3}}}))
                .collect();
            Ok(ApiResponse::new(200, json!({ "results": results })))
        }));
        let first = h
            .queue
            .enqueue(NewOperation::journal_create(json!({"note": "client"})))
            .unwrap();
        let second = h
            .queue
            .enqueue(NewOperation::journal_create(json!({"note": "mine"})))
            .unwrap();
        h.queue.process_queue().await;

        let client = h
            .queue
            .resolve_conflict(&first, Resolution::Client, None)
            .unwrap()
            .unwrap();
        let op = h.queue.operation(&client).unwrap().unwrap();
        assert_eq!(op.priority, Priority::High);
        assert_eq!(op.data, json!({"note": "client"}));
        assert_eq!(op.endpoint, "/journal");
        assert_eq!(
            op.headers.get(RESOLUTION_HEADER).map(String::as_str),
            Some("client-wins")
        );

        let merged = h
            .queue
            .resolve_conflict(&second, Resolution::Merge, None)
            .unwrap()
            .unwrap();
        let op = h.queue.operation(&merged).unwrap().unwrap();
        assert_eq!(op.data, json!({"note": "mine", "streak": 3}));
        assert!(h.queue.conflicts().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_unknown_conflict() {
        let h = harness(ScriptedTransport::new(|_, r| ack_all(r)));
        let err = h
            .queue
            .resolve_conflict("nope", Resolution::Server, None)
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_auto_resolve_prefers_server() {
        let h = harness(ScriptedTransport::new(|_, request| {
            let results: Vec<_> = submitted_ids(request)
                .into_iter()
                .map(|id| json!({"success": false, "operationId": id, "conflict": {}}))
                .collect();
            Ok(ApiResponse::new(200, json!({ "results": results })))
        }));
        h.queue.enqueue(toggle("a")).unwrap();
        h.queue.enqueue(toggle("b")).unwrap();
        h.queue.process_queue().await;

        assert_eq!(h.queue.auto_resolve_conflicts().unwrap(), 2);
        assert!(h.queue.conflicts().unwrap().is_empty());
        assert!(h.queue.operations(Some(OperationStatus::Pending)).is_empty());
    }

    #[tokio::test]
    async fn test_dependencies_hold_back_children() {
        let h = harness(ScriptedTransport::new(|_, r| ack_all(r)));
        let parent = h.queue.enqueue(toggle("parent").with_priority(Priority::Low)).unwrap();
        let child = h
            .queue
            .enqueue(toggle("child").with_priority(Priority::Critical).depends_on(&parent))
            .unwrap();

        // The child outranks its parent, so it waits for the next pass.
        let summary = h.queue.process_queue().await;
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.deferred, 1);
        let op = h.queue.operation(&child).unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.retry_count, 0);

        let summary = h.queue.process_queue().await;
        assert_eq!(summary.processed, 1);
    }

    fn one_per_batch(transport: ScriptedTransport, batching: bool) -> Harness {
        harness_on(
            Arc::new(Database::open_in_memory().unwrap()),
            transport,
            Arc::new(UnavailableRefresher),
            QueueOptions {
                batching,
                batch_size: 1,
                ..test_options()
            },
            true,
        )
    }

    /// Reports a conflict for the first request, acknowledges the rest.
    fn conflict_then_ack() -> ScriptedTransport {
        ScriptedTransport::new(|index, request| {
            if index > 0 {
                return ack_all(request);
            }
            let id = submitted_ids(request).remove(0);
            Ok(ApiResponse::new(
                200,
                json!({"results": [{"success": false, "operationId": id,
                    "conflict": {"serverData": {"completed": false}}}]}),
            ))
        })
    }

    #[tokio::test]
    async fn test_child_waits_when_parent_batch_fails() {
        let h = one_per_batch(
            ScriptedTransport::new(|index, request| {
                if index > 0 {
                    return ack_all(request);
                }
                let id = submitted_ids(request).remove(0);
                Ok(ApiResponse::new(
                    200,
                    json!({"results": [{"success": false, "operationId": id,
                        "error": {"code": "SERVER_ERROR", "message": "try later"}}]}),
                ))
            }),
            true,
        );
        let parent = h.queue.enqueue(toggle("parent")).unwrap();
        let child = h.queue.enqueue(toggle("child").depends_on(&parent)).unwrap();

        let summary = h.queue.process_queue().await;
        assert_eq!(summary.retrying, 1);
        assert_eq!(summary.deferred, 1);
        assert_eq!(h.transport.call_count(), 1);
        let op = h.queue.operation(&child).unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.retry_count, 0);

        let summary = h.queue.process_queue().await;
        assert_eq!(summary.processed, 2);
        let requests = h.transport.requests();
        assert_eq!(submitted_ids(&requests[1]), vec![parent]);
        assert_eq!(submitted_ids(&requests[2]), vec![child]);
    }

    #[tokio::test]
    async fn test_direct_child_waits_when_parent_fails() {
        let h = one_per_batch(
            ScriptedTransport::new(|_, request| {
                if request.endpoint.contains("invalid") {
                    Ok(ApiResponse::new(422, json!({"message": "bad date"})))
                } else {
                    Ok(ApiResponse::new(200, json!({"ok": true})))
                }
            }),
            false,
        );
        let parent = h.queue.enqueue(toggle("invalid")).unwrap();
        let child = h.queue.enqueue(toggle("child").depends_on(&parent)).unwrap();

        let summary = h.queue.process_queue().await;
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.deferred, 1);
        assert_eq!(h.transport.call_count(), 1);
        let op = h.queue.operation(&child).unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.retry_count, 0);
    }

    #[tokio::test]
    async fn test_dependents_follow_client_resubmission() {
        let h = one_per_batch(conflict_then_ack(), true);
        let parent = h.queue.enqueue(toggle("parent")).unwrap();
        let child = h.queue.enqueue(toggle("child").depends_on(&parent)).unwrap();

        let summary = h.queue.process_queue().await;
        assert_eq!(summary.conflicts, 1);
        assert_eq!(summary.deferred, 1);
        assert_eq!(h.transport.call_count(), 1);

        let resent = h
            .queue
            .resolve_conflict(&parent, Resolution::Client, None)
            .unwrap()
            .unwrap();
        assert_eq!(
            h.queue.operation(&child).unwrap().unwrap().dependencies,
            vec![resent.clone()]
        );

        let summary = h.queue.process_queue().await;
        assert_eq!(summary.processed, 2);
        let requests = h.transport.requests();
        assert_eq!(submitted_ids(&requests[1]), vec![resent]);
        assert_eq!(submitted_ids(&requests[2]), vec![child]);
    }

    #[tokio::test]
    async fn test_server_resolution_releases_dependents() {
        let h = one_per_batch(conflict_then_ack(), true);
        let parent = h.queue.enqueue(toggle("parent")).unwrap();
        let child = h.queue.enqueue(toggle("child").depends_on(&parent)).unwrap();
        h.queue.process_queue().await;

        assert!(h
            .queue
            .resolve_conflict(&parent, Resolution::Server, None)
            .unwrap()
            .is_none());
        assert!(h.queue.operation(&child).unwrap().unwrap().dependencies.is_empty());

        let summary = h.queue.process_queue().await;
        assert_eq!(summary.processed, 1);
        assert_eq!(submitted_ids(&h.transport.requests()[1]), vec![child]);
    }

    #[tokio::test]
    async fn test_rejected_write_is_held_until_store_recovers() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let h = harness_on(
            Arc::clone(&db),
            ScriptedTransport::new(|_, r| ack_all(r)),
            Arc::new(UnavailableRefresher),
            test_options(),
            true,
        );
        let exec = |sql: &str| {
            db.with_connection(|conn| {
                conn.execute_batch(sql)
                    .map_err(|e| SyncError::db("test setup", &e))
            })
            .unwrap();
        };
        exec(
            "CREATE TRIGGER reject_writes BEFORE INSERT ON operations
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        );

        let id = h.queue.enqueue(toggle("a")).unwrap();
        assert_eq!(
            h.queue.operation(&id).unwrap().unwrap().status,
            OperationStatus::Pending
        );
        let metrics = h.queue.get_metrics();
        assert_eq!(metrics.total_operations, 1);
        assert_eq!(metrics.pending_operations, 1);

        let summary = h.queue.process_queue().await;
        assert_eq!(summary.deferred, 1);
        assert_eq!(h.transport.call_count(), 0);

        exec("DROP TRIGGER reject_writes;");
        let summary = h.queue.process_queue().await;
        assert_eq!(summary.processed, 1);
        assert_eq!(
            h.queue.operation(&id).unwrap().unwrap().status,
            OperationStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_abort_returns_batch_to_pending() {
        let h = harness(
            ScriptedTransport::new(|_, r| ack_all(r)).with_delay(Duration::from_secs(5)),
        );
        let id = h.queue.enqueue(toggle("a")).unwrap();

        let queue = Arc::clone(&h.queue);
        let pass = tokio::spawn(async move { queue.process_queue().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.queue.is_processing());
        h.queue.abort_processing();

        let summary = pass.await.unwrap();
        assert!(summary.aborted);
        let op = h.queue.operation(&id).unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.retry_count, 0);
    }

    #[tokio::test]
    async fn test_batch_failure_stops_pass_and_reports_delay() {
        let h = harness(ScriptedTransport::new(|_, _| {
            let mut reply = ApiResponse::new(429, json!({"message": "slow down"}));
            reply.retry_after = Some(Duration::from_secs(12));
            Ok(reply)
        }));
        for i in 0..7 {
            h.queue.enqueue(toggle(&format!("h{i}"))).unwrap();
        }

        let summary = h.queue.process_queue().await;
        assert_eq!(h.transport.call_count(), 1);
        assert_eq!(summary.retrying, 5);
        assert_eq!(summary.retry_after, Some(Duration::from_secs(12)));

        // The second batch was never touched.
        let untouched = h
            .queue
            .operations(Some(OperationStatus::Pending))
            .into_iter()
            .filter(|op| op.retry_count == 0)
            .count();
        assert_eq!(untouched, 2);
    }

    #[tokio::test]
    async fn test_direct_mode() {
        let h = harness_on(
            Arc::new(Database::open_in_memory().unwrap()),
            ScriptedTransport::new(|_, request| {
                if request.endpoint.contains("conflicted") {
                    Ok(ApiResponse::new(409, json!({"serverData": {"completed": true}})))
                } else if request.endpoint.contains("invalid") {
                    Ok(ApiResponse::new(422, json!({"message": "bad date"})))
                } else {
                    Ok(ApiResponse::new(201, json!({"ok": true})))
                }
            }),
            Arc::new(UnavailableRefresher),
            QueueOptions {
                batching: false,
                ..test_options()
            },
            true,
        );
        let ok = h.queue.enqueue(toggle("fine")).unwrap();
        let conflicted = h.queue.enqueue(toggle("conflicted")).unwrap();
        let invalid = h.queue.enqueue(toggle("invalid")).unwrap();

        let summary = h.queue.process_queue().await;
        assert_eq!(summary.requests, 3);
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.conflicts, 1);
        assert_eq!(summary.failed, 2);

        let requests = h.transport.requests();
        assert_eq!(requests[0].endpoint, "/habits/fine/toggle");
        assert_eq!(requests[0].body.as_ref().unwrap()["habitId"], "fine");

        let status = |id: &str| h.queue.operation(id).unwrap().unwrap().status;
        assert_eq!(status(&ok), OperationStatus::Completed);
        assert_eq!(status(&conflicted), OperationStatus::Failed);
        assert_eq!(status(&invalid), OperationStatus::Failed);
        assert_eq!(
            h.queue.conflicts().unwrap()[0].server_data,
            json!({"completed": true})
        );
    }

    #[tokio::test]
    async fn test_retry_failed_and_clear() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let h = harness(ScriptedTransport::new(move |_, request| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(ApiResponse::new(400, json!({"message": "bad request"})))
            } else {
                ack_all(request)
            }
        }));
        let id = h.queue.enqueue(toggle("a")).unwrap();
        h.queue.process_queue().await;
        assert_eq!(h.queue.get_metrics().failed_operations, 1);

        assert_eq!(h.queue.retry_failed_operations().unwrap(), 1);
        h.queue.process_queue().await;
        assert_eq!(
            h.queue.operation(&id).unwrap().unwrap().status,
            OperationStatus::Completed
        );

        assert_eq!(h.queue.clear_completed().unwrap(), 1);
        h.queue.enqueue(toggle("b")).unwrap();
        h.queue.clear_all().unwrap();
        assert_eq!(h.queue.get_metrics().total_operations, 0);
    }

    #[tokio::test]
    async fn test_metrics_invariant_after_mixed_pass() {
        let transport = ScriptedTransport::new(|_, request| {
            let results: Vec<_> = submitted_ids(request)
                .into_iter()
                .enumerate()
                .map(|(i, id)| match i % 3 {
                    0 => json!({"success": true, "operationId": id}),
                    1 => json!({"success": false, "operationId": id,
                        "error": {"code": "FORBIDDEN", "message": "no"}}),
                    _ => json!({"success": false, "operationId": id,
                        "error": {"code": "SERVER_ERROR", "message": "oops"}}),
                })
                .collect();
            Ok(ApiResponse::new(200, json!({ "results": results })))
        });
        let h = harness_on(
            Arc::new(Database::open_in_memory().unwrap()),
            transport,
            Arc::new(UnavailableRefresher),
            QueueOptions {
                batch_size: 10,
                ..test_options()
            },
            true,
        );
        for i in 0..9 {
            h.queue.enqueue(toggle(&format!("h{i}"))).unwrap();
        }
        h.queue.process_queue().await;

        let metrics = h.queue.get_metrics();
        assert_eq!(metrics.total_operations, 9);
        assert_eq!(
            metrics.pending_operations + metrics.failed_operations + metrics.completed_operations,
            metrics.total_operations
        );
        assert_eq!(metrics.completed_operations, 3);
        assert_eq!(metrics.failed_operations, 3);
        assert_eq!(metrics.pending_operations, 3);
    }

    #[tokio::test]
    async fn test_interrupted_pass_recovered_on_start() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let store = OperationStore::new(Arc::clone(&db), Lane::Sync);
        let mut op = crate::sync::store::tests::sample("stuck", Priority::Normal);
        op.status = OperationStatus::Syncing;
        store.add(&op).unwrap();

        let h = harness_on(
            db,
            ScriptedTransport::new(|_, r| ack_all(r)),
            Arc::new(UnavailableRefresher),
            test_options(),
            true,
        );
        assert_eq!(
            h.queue.operation("stuck").unwrap().unwrap().status,
            OperationStatus::Pending
        );
        assert_eq!(h.queue.process_queue().await.processed, 1);
    }

    #[tokio::test]
    async fn test_auto_process_on_enqueue() {
        let h = harness_on(
            Arc::new(Database::open_in_memory().unwrap()),
            ScriptedTransport::new(|_, r| ack_all(r)),
            Arc::new(UnavailableRefresher),
            QueueOptions::default(),
            true,
        );
        let mut rx = h.queue.subscribe();
        let id = h.queue.enqueue(toggle("a")).unwrap();

        let done = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(QueueEvent::ProcessingCompleted { processed, .. }) = rx.recv().await {
                    return processed;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(done, 1);
        assert_eq!(
            h.queue.operation(&id).unwrap().unwrap().status,
            OperationStatus::Completed
        );
    }
}
