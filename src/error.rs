//! Error types for habitsync.

use thiserror::Error;

use crate::sync::OperationStatus;
use crate::transport::TransportError;

/// Errors surfaced by the habitsync library.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Database access failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Configuration could not be loaded, saved or resolved.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// A referenced operation, conflict or request does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A status change that the operation state machine forbids.
    #[error("Invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: OperationStatus,
        to: OperationStatus,
    },

    /// The caller supplied data the operation cannot use.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The transport collaborator failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SyncError {
    /// Wrap a `rusqlite` failure with a short description of what was attempted.
    pub(crate) fn db(context: &str, err: &rusqlite::Error) -> Self {
        Self::Database(format!("{context}: {err}"))
    }
}
