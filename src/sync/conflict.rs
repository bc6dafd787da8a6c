//! Data conflicts reported by the server.
//!
//! A conflict is keyed by the id of the operation that triggered it and stays
//! open until resolved.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;
use crate::storage::Database;

/// An unresolved conflict between local and server state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictData {
    /// Id of the operation the server rejected.
    pub id: String,
    pub server_data: Value,
    pub client_data: Value,
    pub conflict_type: String,
    pub detected_at: DateTime<Utc>,
}

/// How to settle a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// Resubmit the local data.
    Client,
    /// Accept the server state; nothing is resubmitted.
    Server,
    /// Resubmit a merge of both sides.
    Merge,
}

impl Resolution {
    /// Header value sent with the resubmitted operation.
    #[must_use]
    pub const fn header_value(self) -> &'static str {
        match self {
            Self::Client => "client-wins",
            Self::Server => "server-wins",
            Self::Merge => "merge",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Client => "client",
            Self::Server => "server",
            Self::Merge => "merge",
        };
        f.write_str(s)
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "client" => Ok(Self::Client),
            "server" => Ok(Self::Server),
            "merge" => Ok(Self::Merge),
            other => Err(format!("unknown resolution: {other} (expected client, server or merge)")),
        }
    }
}

/// Shallow merge of two JSON objects; keys from `client` win.
///
/// # Errors
///
/// Returns `InvalidInput` unless both sides are objects.
pub fn merge_data(server: &Value, client: &Value) -> Result<Value, SyncError> {
    match (server, client) {
        (Value::Object(server), Value::Object(client)) => {
            let mut merged = server.clone();
            for (key, value) in client {
                merged.insert(key.clone(), value.clone());
            }
            Ok(Value::Object(merged))
        },
        _ => Err(SyncError::InvalidInput(
            "automatic merge needs object data on both sides; supply merged data".to_string(),
        )),
    }
}

/// Persistent set of open conflicts.
#[derive(Clone)]
pub struct ConflictStore {
    db: Arc<Database>,
}

impl ConflictStore {
    #[must_use]
    pub const fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Record a conflict, replacing any earlier one for the same operation.
    ///
    /// # Errors
    ///
    /// Returns an error if the conflict cannot be saved.
    pub fn insert(&self, conflict: &ConflictData) -> Result<(), SyncError> {
        let server = serde_json::to_string(&conflict.server_data)?;
        let client = serde_json::to_string(&conflict.client_data)?;

        self.db.with_connection(|conn| {
            conn.execute(
                r"INSERT OR REPLACE INTO conflicts
                    (id, server_data, client_data, conflict_type, detected_at)
                  VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    conflict.id,
                    server,
                    client,
                    conflict.conflict_type,
                    conflict.detected_at.to_rfc3339()
                ],
            )
            .map_err(|e| SyncError::db("Failed to record conflict", &e))?;
            Ok(())
        })
    }

    /// Look up an open conflict.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get(&self, id: &str) -> Result<Option<ConflictData>, SyncError> {
        self.db.with_connection(|conn| {
            match conn.query_row(
                r"SELECT id, server_data, client_data, conflict_type, detected_at
                  FROM conflicts WHERE id = ?1",
                [id],
                row_to_conflict,
            ) {
                Ok(conflict) => Ok(Some(conflict)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(SyncError::db("Failed to query conflict", &e)),
            }
        })
    }

    /// All open conflicts in detection order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list(&self) -> Result<Vec<ConflictData>, SyncError> {
        self.db.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    r"SELECT id, server_data, client_data, conflict_type, detected_at
                      FROM conflicts ORDER BY detected_at ASC, rowid ASC",
                )
                .map_err(|e| SyncError::db("Failed to prepare query", &e))?;
            let rows = stmt
                .query_map([], row_to_conflict)
                .map_err(|e| SyncError::db("Failed to query conflicts", &e))?;

            let mut conflicts = Vec::new();
            for row in rows {
                conflicts.push(row.map_err(|e| SyncError::db("Failed to read conflict", &e))?);
            }
            Ok(conflicts)
        })
    }

    /// Delete a conflict. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn remove(&self, id: &str) -> Result<bool, SyncError> {
        self.db.with_connection(|conn| {
            let rows = conn
                .execute("DELETE FROM conflicts WHERE id = ?1", [id])
                .map_err(|e| SyncError::db("Failed to remove conflict", &e))?;
            Ok(rows > 0)
        })
    }

    /// Delete every conflict.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn clear(&self) -> Result<(), SyncError> {
        self.db.with_connection(|conn| {
            conn.execute("DELETE FROM conflicts", [])
                .map_err(|e| SyncError::db("Failed to clear conflicts", &e))?;
            Ok(())
        })
    }
}

fn row_to_conflict(row: &Row<'_>) -> Result<ConflictData, rusqlite::Error> {
    let server: String = row.get(1)?;
    let client: String = row.get(2)?;
    let detected_at: String = row.get(4)?;

    Ok(ConflictData {
        id: row.get(0)?,
        server_data: serde_json::from_str(&server).unwrap_or(Value::Null),
        client_data: serde_json::from_str(&client).unwrap_or(Value::Null),
        conflict_type: row.get(3)?,
        detected_at: DateTime::parse_from_rfc3339(&detected_at)
            .map_or_else(|_| Utc::now(), |t| t.with_timezone(&Utc)),
    })
}
