//! Operation types for the offline queue.
//!
//! Defines the domain actions that can be queued, their priorities and the
//! status state machine every queued operation follows.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::transport::{ApiRequest, HttpMethod};

/// Domain actions that can be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationType {
    /// Create a habit
    HabitCreate,
    /// Update a habit
    HabitUpdate,
    /// Delete a habit
    HabitDelete,
    /// Mark a habit done or undone for a day
    HabitToggle,
    /// Write a journal entry
    JournalCreate,
    /// Edit a journal entry
    JournalUpdate,
    /// Delete a journal entry
    JournalDelete,
    /// Submit a daily check-in
    CheckinCreate,
    /// Submit a self-assessment survey
    SurveySubmit,
    /// Ad-hoc request queued by the error recovery layer
    Request,
}

impl OperationType {
    /// Every queueable type, in declaration order.
    pub const ALL: [Self; 10] = [
        Self::HabitCreate,
        Self::HabitUpdate,
        Self::HabitDelete,
        Self::HabitToggle,
        Self::JournalCreate,
        Self::JournalUpdate,
        Self::JournalDelete,
        Self::CheckinCreate,
        Self::SurveySubmit,
        Self::Request,
    ];

    /// Wire name, e.g. `habit-toggle`.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::HabitCreate => "habit-create",
            Self::HabitUpdate => "habit-update",
            Self::HabitDelete => "habit-delete",
            Self::HabitToggle => "habit-toggle",
            Self::JournalCreate => "journal-create",
            Self::JournalUpdate => "journal-update",
            Self::JournalDelete => "journal-delete",
            Self::CheckinCreate => "checkin-create",
            Self::SurveySubmit => "survey-submit",
            Self::Request => "request",
        }
    }

    /// Parse a wire name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// Entity the server applies this operation to.
    #[must_use]
    pub const fn entity(&self) -> &'static str {
        match self {
            Self::HabitCreate | Self::HabitUpdate | Self::HabitDelete | Self::HabitToggle => {
                "habit"
            },
            Self::JournalCreate | Self::JournalUpdate | Self::JournalDelete => "journal",
            Self::CheckinCreate => "checkin",
            Self::SurveySubmit => "survey",
            Self::Request => "request",
        }
    }

    /// Verb the server applies to the entity.
    #[must_use]
    pub const fn action(&self) -> &'static str {
        match self {
            Self::HabitCreate | Self::JournalCreate | Self::CheckinCreate => "create",
            Self::HabitUpdate | Self::JournalUpdate => "update",
            Self::HabitDelete | Self::JournalDelete => "delete",
            Self::HabitToggle => "toggle",
            Self::SurveySubmit => "submit",
            Self::Request => "send",
        }
    }

    /// Priority used when the caller does not pick one.
    #[must_use]
    pub const fn default_priority(&self) -> Priority {
        match self {
            // Check-ins are tied to the day they were made.
            Self::CheckinCreate => Priority::Critical,
            Self::HabitToggle | Self::SurveySubmit => Priority::High,
            Self::HabitCreate
            | Self::HabitUpdate
            | Self::HabitDelete
            | Self::JournalCreate
            | Self::JournalUpdate
            | Self::JournalDelete
            | Self::Request => Priority::Normal,
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling priority. Higher variants are submitted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Priority {
    /// Stored rank.
    #[must_use]
    pub const fn rank(self) -> i64 {
        self as i64
    }

    /// Inverse of [`Priority::rank`]; unknown ranks fall back to normal.
    #[must_use]
    pub const fn from_rank(rank: i64) -> Self {
        match rank {
            0 => Self::Low,
            2 => Self::High,
            3 => Self::Critical,
            _ => Self::Normal,
        }
    }

    /// Parse `low`, `normal`, `high` or `critical`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Status of a queued operation.
///
/// ```text
/// pending -> syncing -> completed
///               |   -> failed
///               '---> pending   (retry budget left, or pass aborted)
/// failed  -> pending            (explicit retry of failed operations only)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Waiting to be submitted
    Pending,
    /// Part of the batch currently in flight
    Syncing,
    /// Terminally failed; needs an explicit retry or conflict resolution
    Failed,
    /// Accepted by the server
    Completed,
}

impl OperationStatus {
    /// Whether the processing pass may move an operation from `self` to `next`.
    ///
    /// `failed -> pending` is deliberately absent: only the explicit
    /// retry-failed path may reset a failed operation.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Syncing)
                | (Self::Syncing, Self::Pending | Self::Completed | Self::Failed)
        )
    }

    /// Check if this status is terminal (no more automatic action).
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Stored name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Failed => "failed",
            Self::Completed => "completed",
        }
    }

    /// Convert from string; unknown values read as pending.
    #[must_use]
    pub fn from_string(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "syncing" => Self::Syncing,
            "failed" => Self::Failed,
            "completed" => Self::Completed,
            _ => Self::Pending,
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostic record of the last failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

/// A single pending intent, as persisted by the operation store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    pub id: String,
    #[serde(rename = "type")]
    pub operation_type: OperationType,
    pub endpoint: String,
    pub method: HttpMethod,
    pub data: Value,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

impl QueuedOperation {
    /// Whether the retry budget is used up.
    #[must_use]
    pub const fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// The request this operation issues when sent on its own.
    #[must_use]
    pub fn to_request(&self) -> ApiRequest {
        ApiRequest {
            method: self.method,
            endpoint: self.endpoint.clone(),
            body: if self.data.is_null() {
                None
            } else {
                Some(self.data.clone())
            },
            headers: self.headers.clone(),
        }
    }
}

/// Caller-supplied description of an operation to enqueue.
///
/// The queue fills in id, timestamp, retry count and status.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    pub operation_type: OperationType,
    pub endpoint: String,
    pub method: HttpMethod,
    pub data: Value,
    pub headers: BTreeMap<String, String>,
    pub priority: Priority,
    pub max_retries: Option<u32>,
    pub dependencies: Vec<String>,
}

impl NewOperation {
    /// A POST to `endpoint` with the type's default priority.
    #[must_use]
    pub fn new(operation_type: OperationType, endpoint: impl Into<String>) -> Self {
        Self {
            operation_type,
            endpoint: endpoint.into(),
            method: HttpMethod::Post,
            data: Value::Null,
            headers: BTreeMap::new(),
            priority: operation_type.default_priority(),
            max_retries: None,
            dependencies: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Require `operation_id` to complete before this one is submitted.
    #[must_use]
    pub fn depends_on(mut self, operation_id: impl Into<String>) -> Self {
        self.dependencies.push(operation_id.into());
        self
    }

    /// Toggle a habit for a given day.
    #[must_use]
    pub fn habit_toggle(habit_id: &str, date: &str, completed: bool) -> Self {
        Self::new(
            OperationType::HabitToggle,
            format!("/habits/{habit_id}/toggle"),
        )
        .with_data(json!({ "habitId": habit_id, "date": date, "completed": completed }))
    }

    /// Write a new journal entry.
    #[must_use]
    pub fn journal_create(entry: Value) -> Self {
        Self::new(OperationType::JournalCreate, "/journal").with_data(entry)
    }

    /// Delete a journal entry.
    #[must_use]
    pub fn journal_delete(entry_id: &str) -> Self {
        Self::new(OperationType::JournalDelete, format!("/journal/{entry_id}"))
            .with_method(HttpMethod::Delete)
            .with_data(json!({ "id": entry_id }))
    }

    /// Submit a daily check-in.
    #[must_use]
    pub fn checkin_create(checkin: Value) -> Self {
        Self::new(OperationType::CheckinCreate, "/checkins").with_data(checkin)
    }
}
