//! Durable operation store.
//!
//! Persists queued operations in `SQLite`. One table backs both queues; the
//! `lane` column keeps the domain sync queue and the ad-hoc request queue
//! apart. Reads degrade to empty results on storage failure; writes return
//! errors so the caller can decide how loudly to complain.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde_json::Value;

use super::operation::{OperationError, OperationStatus, OperationType, Priority, QueuedOperation};
use crate::error::SyncError;
use crate::storage::Database;
use crate::transport::HttpMethod;

/// Which queue an operation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    /// Domain operations submitted through the batch endpoint.
    Sync,
    /// Ad-hoc requests owned by the error recovery layer.
    Requests,
}

impl Lane {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Requests => "requests",
        }
    }
}

const COLUMNS: &str = "id, operation_type, endpoint, method, data, headers, priority, created_at,
     retry_count, max_retries, status, last_attempt, error_code, error_message,
     error_status, dependencies, group_id";

/// Keyed, persistent store of queued operations for one lane.
#[derive(Clone)]
pub struct OperationStore {
    db: Arc<Database>,
    lane: Lane,
}

impl OperationStore {
    /// Create a store over a shared database.
    #[must_use]
    pub const fn new(db: Arc<Database>, lane: Lane) -> Self {
        Self { db, lane }
    }

    /// Persist a new operation.
    ///
    /// # Errors
    ///
    /// Returns an error if the operation cannot be saved.
    pub fn add(&self, op: &QueuedOperation) -> Result<(), SyncError> {
        let data = serde_json::to_string(&op.data)?;
        let headers = serde_json::to_string(&op.headers)?;
        let dependencies = serde_json::to_string(&op.dependencies)?;

        self.db.with_connection(|conn| {
            conn.execute(
                r"INSERT INTO operations (
                    id, lane, operation_type, endpoint, method, data, headers, priority,
                    created_at, retry_count, max_retries, status, last_attempt,
                    error_code, error_message, error_status, dependencies, group_id)
                  VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                params![
                    op.id,
                    self.lane.as_str(),
                    op.operation_type.as_str(),
                    op.endpoint,
                    op.method.as_str(),
                    data,
                    headers,
                    op.priority.rank(),
                    op.timestamp.to_rfc3339(),
                    op.retry_count,
                    op.max_retries,
                    op.status.as_str(),
                    op.last_attempt.map(|t| t.to_rfc3339()),
                    op.error.as_ref().map(|e| e.code.clone()),
                    op.error.as_ref().map(|e| e.message.clone()),
                    op.error.as_ref().and_then(|e| e.status_code),
                    dependencies,
                    op.group_id,
                ],
            )
            .map_err(|e| SyncError::db("Failed to add operation", &e))?;
            Ok(())
        })
    }

    /// Get a specific operation by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get(&self, id: &str) -> Result<Option<QueuedOperation>, SyncError> {
        self.db.with_connection(|conn| self.get_with(conn, id))
    }

    fn get_with(&self, conn: &Connection, id: &str) -> Result<Option<QueuedOperation>, SyncError> {
        let sql = format!("SELECT {COLUMNS} FROM operations WHERE lane = ?1 AND id = ?2");
        match conn.query_row(&sql, params![self.lane.as_str(), id], row_to_operation) {
            Ok(op) => Ok(Some(op)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(SyncError::db("Failed to query operation", &e)),
        }
    }

    /// All pending operations in insertion order.
    ///
    /// Storage failures degrade to an empty list.
    #[must_use]
    pub fn get_pending(&self) -> Vec<QueuedOperation> {
        self.get_by_status(OperationStatus::Pending)
    }

    /// All operations with `status`, in insertion order.
    ///
    /// Storage failures degrade to an empty list.
    #[must_use]
    pub fn get_by_status(&self, status: OperationStatus) -> Vec<QueuedOperation> {
        let sql = format!(
            "SELECT {COLUMNS} FROM operations WHERE lane = ?1 AND status = ?2 ORDER BY rowid ASC"
        );
        self.query_degraded(&sql, &[&self.lane.as_str(), &status.as_str()])
    }

    /// Every operation in the lane, in insertion order.
    ///
    /// Storage failures degrade to an empty list.
    #[must_use]
    pub fn all(&self) -> Vec<QueuedOperation> {
        let sql = format!("SELECT {COLUMNS} FROM operations WHERE lane = ?1 ORDER BY rowid ASC");
        self.query_degraded(&sql, &[&self.lane.as_str()])
    }

    fn query_degraded(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Vec<QueuedOperation> {
        let result = self.db.with_connection(|conn| {
            let mut stmt = conn
                .prepare(sql)
                .map_err(|e| SyncError::db("Failed to prepare query", &e))?;
            let rows = stmt
                .query_map(args, row_to_operation)
                .map_err(|e| SyncError::db("Failed to query operations", &e))?;

            let mut operations = Vec::new();
            for row in rows {
                operations.push(row.map_err(|e| SyncError::db("Failed to read operation", &e))?);
            }
            Ok(operations)
        });

        result.unwrap_or_else(|e| {
            tracing::warn!(lane = self.lane.as_str(), error = %e, "operation read degraded to empty");
            Vec::new()
        })
    }

    /// Move an operation to `status`, optionally consuming one retry.
    ///
    /// The transition is checked against the status state machine. Moving
    /// into `syncing` stamps `last_attempt`; reaching `completed` clears the
    /// recorded error. Returns the updated operation.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id, `InvalidTransition` for a forbidden
    /// move, or a database error.
    pub fn update_status(
        &self,
        id: &str,
        status: OperationStatus,
        increment_retry: bool,
    ) -> Result<QueuedOperation, SyncError> {
        self.db.with_connection(|conn| {
            let mut op = self
                .get_with(conn, id)?
                .ok_or_else(|| SyncError::NotFound(format!("operation {id}")))?;

            if !op.status.can_transition_to(status) {
                return Err(SyncError::InvalidTransition {
                    id: id.to_string(),
                    from: op.status,
                    to: status,
                });
            }

            op.status = status;
            if increment_retry {
                op.retry_count = (op.retry_count + 1).min(op.max_retries);
            }
            if status == OperationStatus::Syncing {
                op.last_attempt = Some(Utc::now());
            }
            if status == OperationStatus::Completed {
                op.error = None;
            }

            conn.execute(
                r"UPDATE operations SET
                    status = ?1, retry_count = ?2, last_attempt = ?3,
                    error_code = ?4, error_message = ?5, error_status = ?6
                  WHERE lane = ?7 AND id = ?8",
                params![
                    op.status.as_str(),
                    op.retry_count,
                    op.last_attempt.map(|t| t.to_rfc3339()),
                    op.error.as_ref().map(|e| e.code.clone()),
                    op.error.as_ref().map(|e| e.message.clone()),
                    op.error.as_ref().and_then(|e| e.status_code),
                    self.lane.as_str(),
                    id,
                ],
            )
            .map_err(|e| SyncError::db("Failed to update operation status", &e))?;

            Ok(op)
        })
    }

    /// Record the last error for an operation without changing its status.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn record_error(&self, id: &str, error: &OperationError) -> Result<(), SyncError> {
        self.db.with_connection(|conn| {
            conn.execute(
                r"UPDATE operations SET error_code = ?1, error_message = ?2, error_status = ?3
                  WHERE lane = ?4 AND id = ?5",
                params![
                    error.code,
                    error.message,
                    error.status_code,
                    self.lane.as_str(),
                    id
                ],
            )
            .map_err(|e| SyncError::db("Failed to record operation error", &e))?;
            Ok(())
        })
    }

    /// Reset failed operations that still have retry budget back to pending.
    ///
    /// This is the only path from `failed` to `pending`. Operations with an
    /// open conflict stay failed until the conflict is resolved.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn reset_failed(&self) -> Result<usize, SyncError> {
        self.db.with_connection(|conn| {
            conn.execute(
                r"UPDATE operations SET status = 'pending'
                  WHERE lane = ?1 AND status = 'failed' AND retry_count < max_retries
                    AND id NOT IN (SELECT id FROM conflicts)",
                [self.lane.as_str()],
            )
            .map_err(|e| SyncError::db("Failed to reset failed operations", &e))
        })
    }

    /// Point every dependency on `old` at `new`, or drop it when `new` is
    /// `None`. Returns the number of operations changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the operations cannot be read or updated.
    pub fn replace_dependency(&self, old: &str, new: Option<&str>) -> Result<usize, SyncError> {
        self.db.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, dependencies FROM operations WHERE lane = ?1 AND dependencies LIKE ?2",
                )
                .map_err(|e| SyncError::db("Failed to prepare dependency query", &e))?;
            let rows = stmt
                .query_map(params![self.lane.as_str(), format!("%\"{old}\"%")], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(|e| SyncError::db("Failed to query dependencies", &e))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| SyncError::db("Failed to read dependencies", &e))?;

            let mut changed = 0;
            for (id, raw) in rows {
                let dependencies: Vec<String> = serde_json::from_str(&raw)?;
                if !dependencies.iter().any(|dep| dep == old) {
                    continue;
                }

                let mut next: Vec<String> = Vec::with_capacity(dependencies.len());
                for dep in dependencies {
                    let dep = if dep == old {
                        match new {
                            Some(new) => new.to_string(),
                            None => continue,
                        }
                    } else {
                        dep
                    };
                    if !next.contains(&dep) {
                        next.push(dep);
                    }
                }

                conn.execute(
                    "UPDATE operations SET dependencies = ?1 WHERE lane = ?2 AND id = ?3",
                    params![serde_json::to_string(&next)?, self.lane.as_str(), id],
                )
                .map_err(|e| SyncError::db("Failed to update dependencies", &e))?;
                changed += 1;
            }
            Ok(changed)
        })
    }

    /// Return operations stranded in `syncing` (e.g. by a crash) to pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub fn recover_interrupted(&self) -> Result<usize, SyncError> {
        self.db.with_connection(|conn| {
            conn.execute(
                "UPDATE operations SET status = 'pending' WHERE lane = ?1 AND status = 'syncing'",
                [self.lane.as_str()],
            )
            .map_err(|e| SyncError::db("Failed to recover interrupted operations", &e))
        })
    }

    /// Delete an operation.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn remove(&self, id: &str) -> Result<bool, SyncError> {
        self.db.with_connection(|conn| {
            let rows = conn
                .execute(
                    "DELETE FROM operations WHERE lane = ?1 AND id = ?2",
                    [self.lane.as_str(), id],
                )
                .map_err(|e| SyncError::db("Failed to remove operation", &e))?;
            Ok(rows > 0)
        })
    }

    /// Delete every operation with `status`.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn remove_by_status(&self, status: OperationStatus) -> Result<usize, SyncError> {
        self.db.with_connection(|conn| {
            conn.execute(
                "DELETE FROM operations WHERE lane = ?1 AND status = ?2",
                [self.lane.as_str(), status.as_str()],
            )
            .map_err(|e| SyncError::db("Failed to remove operations", &e))
        })
    }

    /// Delete every operation in the lane.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn clear(&self) -> Result<(), SyncError> {
        self.db.with_connection(|conn| {
            conn.execute("DELETE FROM operations WHERE lane = ?1", [self.lane.as_str()])
                .map_err(|e| SyncError::db("Failed to clear operations", &e))?;
            Ok(())
        })
    }
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .ok()
}

fn row_to_operation(row: &Row<'_>) -> Result<QueuedOperation, rusqlite::Error> {
    let operation_type: String = row.get(1)?;
    let method: String = row.get(3)?;
    let data: String = row.get(4)?;
    let headers: String = row.get(5)?;
    let created_at: String = row.get(7)?;
    let last_attempt: Option<String> = row.get(11)?;
    let error_code: Option<String> = row.get(12)?;
    let error_message: Option<String> = row.get(13)?;
    let error_status: Option<u16> = row.get(14)?;
    let dependencies: String = row.get(15)?;

    let error = error_code.map(|code| OperationError {
        code,
        message: error_message.unwrap_or_default(),
        status_code: error_status,
    });

    Ok(QueuedOperation {
        id: row.get(0)?,
        operation_type: OperationType::parse(&operation_type).unwrap_or(OperationType::Request),
        endpoint: row.get(2)?,
        method: method.parse::<HttpMethod>().unwrap_or_default(),
        data: serde_json::from_str(&data).unwrap_or(Value::Null),
        headers: serde_json::from_str::<BTreeMap<String, String>>(&headers).unwrap_or_default(),
        priority: Priority::from_rank(row.get(6)?),
        timestamp: parse_time(&created_at).unwrap_or_else(Utc::now),
        retry_count: row.get(8)?,
        max_retries: row.get(9)?,
        status: OperationStatus::from_string(&row.get::<_, String>(10)?),
        last_attempt: last_attempt.as_deref().and_then(parse_time),
        error,
        dependencies: serde_json::from_str(&dependencies).unwrap_or_default(),
        group_id: row.get(16)?,
    })
}
