//! Wiring for the whole sync engine.
//!
//! [`SyncEngine`] owns the database and builds every component on top of
//! it. There is no global state: callers construct one engine and share the
//! handles it exposes.

use std::sync::Arc;

use crate::config::{Config, Paths};
use crate::error::SyncError;
use crate::recovery::{
    default_strategies, ErrorRecovery, OfflineRunSummary, RefreshGate, TokenRefresher,
};
use crate::storage::Database;
use crate::sync::{
    device_id, ConflictStore, Connectivity, Lane, OfflineQueue, OperationStore, PassSummary,
    QueueOptions, SyncTrigger,
};
use crate::transport::Transport;

pub struct SyncEngine {
    queue: Arc<OfflineQueue>,
    recovery: Arc<ErrorRecovery>,
    connectivity: Connectivity,
    trigger: SyncTrigger,
    device_id: String,
    durable: bool,
}

impl SyncEngine {
    /// Open the engine on the database under `paths`.
    ///
    /// If the data directory or database cannot be used the engine runs on
    /// an in-memory database instead; see [`SyncEngine::is_durable`].
    ///
    /// # Errors
    ///
    /// Returns an error only if no database at all can be created.
    pub fn open(
        config: &Config,
        paths: &Paths,
        transport: Arc<dyn Transport>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Result<Self, SyncError> {
        if let Err(e) = paths.ensure_dirs() {
            tracing::warn!(error = %e, "data directory unavailable");
        }
        let (db, durable) = Database::open_or_memory(&paths.database)?;
        Ok(Self::assemble(db, durable, config, transport, refresher))
    }

    /// An engine that keeps everything in memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn in_memory(
        config: &Config,
        transport: Arc<dyn Transport>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Result<Self, SyncError> {
        let db = Database::open_in_memory()?;
        Ok(Self::assemble(db, false, config, transport, refresher))
    }

    fn assemble(
        db: Database,
        durable: bool,
        config: &Config,
        transport: Arc<dyn Transport>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Self {
        let db = Arc::new(db);
        let device_id = device_id(&db);

        let gate = Arc::new(RefreshGate::new(refresher));
        let recovery = Arc::new(ErrorRecovery::new(
            default_strategies(&config.recovery, gate),
            OperationStore::new(Arc::clone(&db), Lane::Requests),
            Arc::clone(&transport),
            config.server.request_timeout(),
            config.recovery.offline_request_max_attempts,
        ));

        let connectivity = Connectivity::default();
        let queue = Arc::new(OfflineQueue::new(
            OperationStore::new(Arc::clone(&db), Lane::Sync),
            ConflictStore::new(db),
            Arc::clone(&recovery),
            transport,
            connectivity.clone(),
            device_id.clone(),
            QueueOptions::from_config(config),
        ));
        let trigger = SyncTrigger::new(
            Arc::clone(&queue),
            Arc::clone(&recovery),
            connectivity.clone(),
            config.queue.sync_interval(),
        );

        tracing::debug!(%device_id, durable, "sync engine ready");
        Self {
            queue,
            recovery,
            connectivity,
            trigger,
            device_id,
            durable,
        }
    }

    #[must_use]
    pub const fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    #[must_use]
    pub const fn recovery(&self) -> &Arc<ErrorRecovery> {
        &self.recovery
    }

    #[must_use]
    pub const fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Whether operations survive a restart.
    #[must_use]
    pub const fn is_durable(&self) -> bool {
        self.durable
    }

    /// Start background syncing. Returns false if already started.
    pub fn start(&self) -> bool {
        self.trigger.start()
    }

    /// Stop background syncing and wait for the task to finish.
    pub async fn stop(&self) {
        self.trigger.stop().await;
    }

    /// Process the domain queue, then the offline request queue.
    pub async fn sync_now(&self) -> (PassSummary, OfflineRunSummary) {
        self.trigger.sync_now().await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::recovery::{OfflineRequestOptions, RecoveryContext, UnavailableRefresher};
    use crate::sync::queue::tests::ack_all;
    use crate::sync::{NewOperation, OperationStatus};
    use crate::transport::testing::ScriptedTransport;
    use crate::transport::{ApiRequest, ApiResponse};

    fn config() -> Config {
        let mut config = Config::default();
        config.queue.auto_process = false;
        config
    }

    fn acking() -> Arc<ScriptedTransport> {
        Arc::new(ScriptedTransport::new(|_, request| {
            if request.body.as_ref().is_some_and(|b| b.get("operations").is_some()) {
                ack_all(request)
            } else {
                Ok(ApiResponse::new(200, json!({"ok": true})))
            }
        }))
    }

    fn open(paths: &Paths) -> SyncEngine {
        SyncEngine::open(&config(), paths, acking(), Arc::new(UnavailableRefresher)).unwrap()
    }

    fn memory(transport: Arc<ScriptedTransport>) -> SyncEngine {
        SyncEngine::in_memory(&config(), transport, Arc::new(UnavailableRefresher)).unwrap()
    }

    #[tokio::test]
    async fn test_operations_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::with_root(dir.path().join("data"));

        let engine = open(&paths);
        assert!(engine.is_durable());
        let id = engine
            .queue()
            .enqueue(NewOperation::habit_toggle("h1", "2024-06-01", true))
            .unwrap();
        let device = engine.device_id().to_string();
        drop(engine);

        let engine = open(&paths);
        assert_eq!(engine.device_id(), device);
        let op = engine.queue().operation(&id).unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
    }

    #[tokio::test]
    async fn test_sync_now_drains_both_queues() {
        let transport = acking();
        let engine = memory(transport.clone());
        engine
            .queue()
            .enqueue(NewOperation::habit_toggle("h1", "2024-06-01", true))
            .unwrap();
        engine
            .recovery()
            .queue_offline_request(
                ApiRequest::post("/profile", json!({"name": "sam"})),
                OfflineRequestOptions::default(),
                &RecoveryContext::default(),
            )
            .unwrap();

        let (pass, requests) = engine.sync_now().await;
        assert_eq!(pass.processed, 1);
        assert_eq!(requests.sent, 1);
        assert_eq!(transport.call_count(), 2);
        assert!(engine.recovery().pending_requests().is_empty());
    }

    #[tokio::test]
    async fn test_offline_engine_defers() {
        let transport = acking();
        let engine = memory(transport.clone());
        engine.connectivity().set_online(false);
        engine
            .queue()
            .enqueue(NewOperation::habit_toggle("h1", "2024-06-01", true))
            .unwrap();

        let (pass, _) = engine.sync_now().await;
        assert!(pass.skipped);
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_start_stop() {
        let engine = memory(acking());
        assert!(engine.start());
        assert!(!engine.start());
        engine.stop().await;
    }
}
