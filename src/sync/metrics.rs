//! Queue metrics and health.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::operation::{OperationStatus, QueuedOperation};
use crate::config::QueueConfig;

/// Derived early-warning signal for the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueHealth {
    Healthy,
    Warning,
    Error,
}

impl fmt::Display for QueueHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Thresholds used to derive [`QueueHealth`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthPolicy {
    pub high_water_mark: usize,
    pub stale_after: Duration,
    pub failure_ratio: f64,
}

impl From<&QueueConfig> for HealthPolicy {
    fn from(config: &QueueConfig) -> Self {
        Self {
            high_water_mark: config.high_water_mark,
            stale_after: Duration::minutes(config.stale_after_minutes),
            failure_ratio: config.failure_ratio_threshold,
        }
    }
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

/// Snapshot of the queue.
///
/// `pending_operations` includes operations currently syncing, so
/// `pending + failed + completed == total` always holds.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetrics {
    pub total_operations: usize,
    pub pending_operations: usize,
    pub failed_operations: usize,
    pub completed_operations: usize,
    pub average_retry_count: f64,
    pub oldest_pending_operation: Option<DateTime<Utc>>,
    pub queue_health: QueueHealth,
}

impl QueueMetrics {
    /// Compute metrics over every stored operation.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn compute(
        operations: &[QueuedOperation],
        policy: &HealthPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        let mut pending = 0;
        let mut failed = 0;
        let mut completed = 0;
        let mut retries: u64 = 0;
        let mut oldest: Option<DateTime<Utc>> = None;

        for op in operations {
            retries += u64::from(op.retry_count);
            match op.status {
                OperationStatus::Pending | OperationStatus::Syncing => {
                    pending += 1;
                    oldest = Some(oldest.map_or(op.timestamp, |t| t.min(op.timestamp)));
                },
                OperationStatus::Failed => failed += 1,
                OperationStatus::Completed => completed += 1,
            }
        }

        let total = operations.len();
        let average_retry_count = if total == 0 {
            0.0
        } else {
            retries as f64 / total as f64
        };

        let queue_health = if total > 0 && failed as f64 / total as f64 > policy.failure_ratio {
            QueueHealth::Error
        } else if pending > policy.high_water_mark
            || oldest.is_some_and(|t| now - t > policy.stale_after)
        {
            QueueHealth::Warning
        } else {
            QueueHealth::Healthy
        };

        Self {
            total_operations: total,
            pending_operations: pending,
            failed_operations: failed,
            completed_operations: completed,
            average_retry_count,
            oldest_pending_operation: oldest,
            queue_health,
        }
    }
}
