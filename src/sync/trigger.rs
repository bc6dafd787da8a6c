//! Connectivity signal and the task that schedules processing passes.

use std::future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

use super::queue::{OfflineQueue, PassSummary};
use crate::recovery::{ErrorRecovery, OfflineRunSummary};

/// Shared online/offline flag.
///
/// Cloning yields another handle to the same flag.
#[derive(Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    #[must_use]
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    /// Record the current state; subscribers only hear about real changes.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            tracing::info!(online, "connectivity changed");
        }
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Runs processing passes on reconnect, on a timer, and when a failed pass
/// asked to be retried after a delay.
pub struct SyncTrigger {
    queue: Arc<OfflineQueue>,
    recovery: Arc<ErrorRecovery>,
    connectivity: Connectivity,
    interval: Option<Duration>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncTrigger {
    #[must_use]
    pub fn new(
        queue: Arc<OfflineQueue>,
        recovery: Arc<ErrorRecovery>,
        connectivity: Connectivity,
        interval: Option<Duration>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            queue,
            recovery,
            connectivity,
            interval,
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Spawn the trigger task. Returns false if it is already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return false;
        }

        self.shutdown.send_replace(false);
        let shutdown = self.shutdown.subscribe();
        let queue = Arc::clone(&self.queue);
        let recovery = Arc::clone(&self.recovery);
        let connectivity = self.connectivity.clone();
        let interval = self.interval;

        *task = Some(tokio::spawn(async move {
            run(queue, recovery, connectivity, interval, shutdown).await;
        }));
        tracing::debug!("sync trigger started");
        true
    }

    /// Signal the task to stop and wait for it.
    pub async fn stop(&self) {
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.shutdown.send_replace(true);

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "sync trigger task ended abnormally");
            }
            tracing::debug!("sync trigger stopped");
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Run one domain pass followed by one offline request pass.
    ///
    /// Both are skipped while offline.
    pub async fn sync_now(&self) -> (PassSummary, OfflineRunSummary) {
        sync_pass(&self.queue, &self.recovery, &self.connectivity).await
    }
}

async fn sync_pass(
    queue: &OfflineQueue,
    recovery: &ErrorRecovery,
    connectivity: &Connectivity,
) -> (PassSummary, OfflineRunSummary) {
    let pass = queue.process_queue().await;
    let requests = if connectivity.is_online() {
        recovery.process_offline_requests().await
    } else {
        OfflineRunSummary {
            skipped: true,
            ..OfflineRunSummary::default()
        }
    };
    (pass, requests)
}

async fn scheduled_pass(
    queue: &OfflineQueue,
    recovery: &ErrorRecovery,
    connectivity: &Connectivity,
) -> Option<Instant> {
    let (pass, _) = sync_pass(queue, recovery, connectivity).await;
    pass.retry_after.map(|delay| {
        tracing::debug!(?delay, "next pass scheduled");
        Instant::now() + delay
    })
}

async fn next_tick(ticker: Option<&mut Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        },
        None => future::pending().await,
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

async fn run(
    queue: Arc<OfflineQueue>,
    recovery: Arc<ErrorRecovery>,
    connectivity: Connectivity,
    interval: Option<Duration>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut online_rx = connectivity.subscribe();
    let mut was_online = *online_rx.borrow_and_update();
    let mut ticker = interval.map(|period| {
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    let mut retry_at = if was_online {
        scheduled_pass(&queue, &recovery, &connectivity).await
    } else {
        None
    };

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            changed = online_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let online = *online_rx.borrow_and_update();
                if online && !was_online {
                    tracing::info!("back online, syncing");
                    retry_at = scheduled_pass(&queue, &recovery, &connectivity).await;
                } else if !online {
                    queue.abort_processing();
                }
                was_online = online;
            },
            () = next_tick(ticker.as_mut()) => {
                if connectivity.is_online() {
                    retry_at = scheduled_pass(&queue, &recovery, &connectivity).await;
                }
            },
            () = until(retry_at) => {
                retry_at = None;
                if connectivity.is_online() {
                    retry_at = scheduled_pass(&queue, &recovery, &connectivity).await;
                }
            },
        }
    }
}
