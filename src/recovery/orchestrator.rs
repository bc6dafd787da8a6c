//! Error recovery orchestrator.
//!
//! Classifies failures, tells listeners, and lets the first matching strategy
//! decide what happens next. Also owns the queue of ad-hoc requests that
//! could not be sent, stored in the `requests` lane of the operation store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::classifier::{classify, UiError};
use super::strategy::{RecoveryAction, RecoveryContext, RecoveryResult, RecoveryStrategy};
use crate::error::SyncError;
use crate::sync::{
    sort_for_submission, OperationError, OperationStatus, OperationStore, OperationType, Priority,
    QueuedOperation,
};
use crate::transport::{self, ApiRequest, ApiResponse, Transport, TransportError};

/// Handle returned by [`ErrorRecovery::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&UiError, &RecoveryContext) + Send + Sync>;

/// Options for [`ErrorRecovery::queue_offline_request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfflineRequestOptions {
    pub priority: Priority,
    /// Overrides the configured attempt cap.
    pub max_attempts: Option<u32>,
}

impl Default for OfflineRequestOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            max_attempts: None,
        }
    }
}

/// Outcome of one pass over the offline request queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OfflineRunSummary {
    /// Requests delivered and removed.
    pub sent: usize,
    /// Requests that failed and will be tried again.
    pub retained: usize,
    /// Requests removed after using up their attempts.
    pub dropped: usize,
    /// Whether the pass was skipped because another one was running.
    pub skipped: bool,
}

pub struct ErrorRecovery {
    strategies: Vec<Box<dyn RecoveryStrategy>>,
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
    requests: OperationStore,
    transport: Arc<dyn Transport>,
    timeout: Duration,
    max_attempts: u32,
    processing: Mutex<()>,
}

impl ErrorRecovery {
    /// Build an orchestrator over the given strategies, tried in order.
    ///
    /// Requests left mid-send by an earlier process are returned to pending.
    #[must_use]
    pub fn new(
        strategies: Vec<Box<dyn RecoveryStrategy>>,
        requests: OperationStore,
        transport: Arc<dyn Transport>,
        timeout: Duration,
        max_attempts: u32,
    ) -> Self {
        if let Err(e) = requests.recover_interrupted() {
            tracing::warn!(error = %e, "could not recover interrupted offline requests");
        }
        Self {
            strategies,
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            requests,
            transport,
            timeout,
            max_attempts,
            processing: Mutex::new(()),
        }
    }

    /// Register a callback invoked with every classified error.
    pub fn add_listener(
        &self,
        listener: impl Fn(&UiError, &RecoveryContext) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    /// Unregister a callback. Returns whether it was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Name of the strategy that would handle `error`.
    #[must_use]
    pub fn strategy_for(&self, error: &UiError) -> Option<&'static str> {
        self.strategies
            .iter()
            .find(|s| s.can_handle(error))
            .map(|s| s.name())
    }

    /// Classify a failure and return the recovery verdict. Never fails.
    pub async fn handle_error(
        &self,
        error: &TransportError,
        context: &RecoveryContext,
    ) -> RecoveryResult {
        self.handle_classified(&classify(error), context).await
    }

    /// Route an already classified failure.
    pub async fn handle_classified(
        &self,
        error: &UiError,
        context: &RecoveryContext,
    ) -> RecoveryResult {
        tracing::debug!(
            code = %error.code,
            operation = context.operation.as_deref().unwrap_or("-"),
            retry_count = context.retry_count,
            detail = %error.technical_message,
            "handling error"
        );

        // Clone out so listeners run without holding the lock.
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(error, context);
        }

        let Some(strategy) = self.strategies.iter().find(|s| s.can_handle(error)) else {
            return RecoveryResult::of(RecoveryAction::Fallback, false)
                .with_message(error.message.clone());
        };

        let result = strategy.handle(error, context).await;
        tracing::debug!(
            strategy = strategy.name(),
            action = %result.action,
            retry_after = ?result.retry_after,
            "recovery verdict"
        );
        result
    }

    /// Store a request to be sent when connectivity returns.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be stored.
    pub fn queue_offline_request(
        &self,
        request: ApiRequest,
        options: OfflineRequestOptions,
        context: &RecoveryContext,
    ) -> Result<String, SyncError> {
        let id = format!("req_{}", Uuid::new_v4().simple());
        let op = QueuedOperation {
            id: id.clone(),
            operation_type: OperationType::Request,
            endpoint: request.endpoint,
            method: request.method,
            data: request.body.unwrap_or_default(),
            headers: request.headers,
            priority: options.priority,
            timestamp: Utc::now(),
            retry_count: 0,
            max_retries: options.max_attempts.unwrap_or(self.max_attempts).max(1),
            status: OperationStatus::Pending,
            last_attempt: None,
            error: None,
            dependencies: Vec::new(),
            group_id: None,
        };
        self.requests.add(&op)?;

        tracing::info!(
            request_id = %id,
            endpoint = %op.endpoint,
            operation = context.operation.as_deref().unwrap_or("-"),
            "queued request for later delivery"
        );
        Ok(id)
    }

    /// Requests waiting to be sent, in send order.
    #[must_use]
    pub fn pending_requests(&self) -> Vec<QueuedOperation> {
        let mut pending = self.requests.get_pending();
        sort_for_submission(&mut pending);
        pending
    }

    /// Drop every queued request.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be cleared.
    pub fn clear_offline_requests(&self) -> Result<(), SyncError> {
        self.requests.clear()
    }

    /// Send every queued request once.
    ///
    /// Delivered requests are removed. Failed requests consume one attempt
    /// and are removed for good when none are left. A pass already running
    /// makes this call a no-op.
    pub async fn process_offline_requests(&self) -> OfflineRunSummary {
        let Ok(_guard) = self.processing.try_lock() else {
            return OfflineRunSummary {
                skipped: true,
                ..OfflineRunSummary::default()
            };
        };

        let mut summary = OfflineRunSummary::default();
        for op in self.pending_requests() {
            if let Err(e) = self.requests.update_status(&op.id, OperationStatus::Syncing, false) {
                tracing::warn!(request_id = %op.id, error = %e, "skipping offline request");
                continue;
            }

            let outcome =
                transport::send(self.transport.as_ref(), &op.to_request(), self.timeout, None)
                    .await;
            if let Err(e) = self.settle(&op, outcome, &mut summary) {
                tracing::warn!(request_id = %op.id, error = %e, "could not record request outcome");
            }
        }

        tracing::debug!(
            sent = summary.sent,
            retained = summary.retained,
            dropped = summary.dropped,
            "offline request pass finished"
        );
        summary
    }

    fn settle(
        &self,
        op: &QueuedOperation,
        outcome: Result<ApiResponse, TransportError>,
        summary: &mut OfflineRunSummary,
    ) -> Result<(), SyncError> {
        match outcome {
            Ok(_) => {
                self.requests.remove(&op.id)?;
                summary.sent += 1;
            },
            Err(e) => {
                let ui = classify(&e);
                self.requests.record_error(
                    &op.id,
                    &OperationError {
                        code: ui.code.as_str().to_string(),
                        message: ui.technical_message,
                        status_code: ui.status_code,
                    },
                )?;
                let updated = self.requests.update_status(&op.id, OperationStatus::Pending, true)?;
                if updated.retries_exhausted() {
                    tracing::warn!(
                        request_id = %op.id,
                        endpoint = %op.endpoint,
                        attempts = updated.retry_count,
                        code = %ui.code,
                        "dropping offline request after final attempt"
                    );
                    self.requests.remove(&op.id)?;
                    summary.dropped += 1;
                } else {
                    summary.retained += 1;
                }
            },
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::{json, Value};

    use super::*;
    use crate::config::RecoveryConfig;
    use crate::recovery::auth::{RefreshGate, UnavailableRefresher};
    use crate::recovery::classifier::ErrorCode;
    use crate::recovery::strategy::default_strategies;
    use crate::storage::Database;
    use crate::sync::Lane;
    use crate::transport::testing::ScriptedTransport;

    fn recovery(transport: Arc<ScriptedTransport>) -> ErrorRecovery {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let gate = Arc::new(RefreshGate::new(Arc::new(UnavailableRefresher)));
        ErrorRecovery::new(
            default_strategies(&RecoveryConfig::default(), gate),
            OperationStore::new(db, Lane::Requests),
            transport,
            Duration::from_secs(1),
            3,
        )
    }

    fn ok_transport() -> Arc<ScriptedTransport> {
        Arc::new(ScriptedTransport::new(|_, _| Ok(ApiResponse::new(200, Value::Null))))
    }

    #[tokio::test]
    async fn test_handle_error_routes_to_strategy() {
        let recovery = recovery(ok_transport());
        let result = recovery
            .handle_error(
                &TransportError::Http {
                    status: 422,
                    code: None,
                    message: "title required".to_string(),
                    retry_after: None,
                    body: Value::Null,
                },
                &RecoveryContext::default(),
            )
            .await;
        assert_eq!(result.action, RecoveryAction::ShowError);
        assert!(result.requires_user_action);
    }

    #[tokio::test]
    async fn test_listeners_are_notified_until_removed() {
        let recovery = recovery(ok_transport());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let id = recovery.add_listener(move |error, _| {
            assert_eq!(error.code, ErrorCode::Timeout);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let timeout = TransportError::Timeout(Duration::from_secs(30));
        recovery.handle_error(&timeout, &RecoveryContext::default()).await;
        assert!(recovery.remove_listener(id));
        assert!(!recovery.remove_listener(id));
        recovery.handle_error(&timeout, &RecoveryContext::default()).await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_offline_request_delivered_and_removed() {
        let transport = ok_transport();
        let recovery = recovery(Arc::clone(&transport));
        let id = recovery
            .queue_offline_request(
                ApiRequest::post("/feedback", json!({"text": "hi"})),
                OfflineRequestOptions::default(),
                &RecoveryContext::new("send feedback", 0),
            )
            .unwrap();
        assert!(id.starts_with("req_"));
        assert_eq!(recovery.pending_requests().len(), 1);

        let summary = recovery.process_offline_requests().await;
        assert_eq!(summary.sent, 1);
        assert!(recovery.pending_requests().is_empty());
        assert_eq!(transport.requests()[0].endpoint, "/feedback");
    }

    #[tokio::test]
    async fn test_offline_request_dropped_after_three_attempts() {
        let transport = Arc::new(ScriptedTransport::new(|_, _| {
            Err(TransportError::Connection("refused".to_string()))
        }));
        let recovery = recovery(Arc::clone(&transport));
        recovery
            .queue_offline_request(
                ApiRequest::post("/feedback", json!({})),
                OfflineRequestOptions::default(),
                &RecoveryContext::default(),
            )
            .unwrap();

        for _ in 0..2 {
            let summary = recovery.process_offline_requests().await;
            assert_eq!(summary.retained, 1);
        }
        let summary = recovery.process_offline_requests().await;
        assert_eq!(summary.dropped, 1);
        assert!(recovery.pending_requests().is_empty());
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_offline_passes_collapse() {
        let transport = Arc::new(
            ScriptedTransport::new(|_, _| Ok(ApiResponse::new(200, Value::Null)))
                .with_delay(Duration::from_millis(50)),
        );
        let recovery = recovery(Arc::clone(&transport));
        recovery
            .queue_offline_request(
                ApiRequest::post("/a", json!({})),
                OfflineRequestOptions::default(),
                &RecoveryContext::default(),
            )
            .unwrap();

        let (first, second) = tokio::join!(
            recovery.process_offline_requests(),
            recovery.process_offline_requests()
        );
        assert!(first.skipped ^ second.skipped);
        assert_eq!(transport.call_count(), 1);
    }
}
