//! Recovery strategies, one per error family.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;

use super::auth::RefreshGate;
use super::classifier::{classify, ErrorCategory, ErrorCode, UiError};
use crate::config::RecoveryConfig;

/// What the caller should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryAction {
    Retry,
    RefreshToken,
    RedirectLogin,
    QueueOffline,
    UseCachedData,
    ShowError,
    Fallback,
    Ignore,
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Retry => "RETRY",
            Self::RefreshToken => "REFRESH_TOKEN",
            Self::RedirectLogin => "REDIRECT_LOGIN",
            Self::QueueOffline => "QUEUE_OFFLINE",
            Self::UseCachedData => "USE_CACHED_DATA",
            Self::ShowError => "SHOW_ERROR",
            Self::Fallback => "FALLBACK",
            Self::Ignore => "IGNORE",
        };
        f.write_str(s)
    }
}

/// Verdict of a strategy.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryResult {
    /// Whether the failure can be recovered from without the user.
    pub success: bool,
    pub action: RecoveryAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_data: Option<Value>,
    pub requires_user_action: bool,
}

impl RecoveryResult {
    #[must_use]
    pub const fn retry(after: Duration) -> Self {
        Self {
            success: true,
            action: RecoveryAction::Retry,
            message: None,
            retry_after: Some(after),
            fallback_data: None,
            requires_user_action: false,
        }
    }

    #[must_use]
    pub const fn of(action: RecoveryAction, success: bool) -> Self {
        Self {
            success,
            action,
            message: None,
            retry_after: None,
            fallback_data: None,
            requires_user_action: false,
        }
    }

    /// Terminal verdict shown to the user.
    #[must_use]
    pub fn show_error(message: impl Into<String>, requires_user_action: bool) -> Self {
        Self {
            message: Some(message.into()),
            requires_user_action,
            ..Self::of(RecoveryAction::ShowError, false)
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    #[must_use]
    pub const fn needing_user(mut self) -> Self {
        self.requires_user_action = true;
        self
    }
}

/// Caller-side facts a strategy may use.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryContext {
    /// What was being attempted, for logs.
    pub operation: Option<String>,
    /// Attempts already made.
    pub retry_count: u32,
    /// Last known good data, if the caller has any.
    pub cached_data: Option<Value>,
}

impl RecoveryContext {
    #[must_use]
    pub fn new(operation: impl Into<String>, retry_count: u32) -> Self {
        Self {
            operation: Some(operation.into()),
            retry_count,
            cached_data: None,
        }
    }

    #[must_use]
    pub fn with_cached_data(mut self, data: Value) -> Self {
        self.cached_data = Some(data);
        self
    }
}

/// Policy for one family of errors.
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn can_handle(&self, error: &UiError) -> bool;

    async fn handle(&self, error: &UiError, context: &RecoveryContext) -> RecoveryResult;
}

/// Exponential backoff for connectivity failures.
pub struct NetworkStrategy {
    base: Duration,
    cap: Duration,
    jitter_ms: u64,
    max_retries: u32,
}

impl NetworkStrategy {
    #[must_use]
    pub const fn new(config: &RecoveryConfig) -> Self {
        Self {
            base: Duration::from_millis(config.network_base_delay_ms),
            cap: Duration::from_millis(config.network_max_delay_ms),
            jitter_ms: config.network_jitter_ms,
            max_retries: config.network_max_retries,
        }
    }

    /// `min(base * 2^retry + jitter, cap)`.
    #[must_use]
    pub fn delay(&self, retry_count: u32) -> Duration {
        let factor = 1_u32 << retry_count.min(16);
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        self.base
            .saturating_mul(factor)
            .saturating_add(Duration::from_millis(jitter))
            .min(self.cap)
    }
}

#[async_trait]
impl RecoveryStrategy for NetworkStrategy {
    fn name(&self) -> &'static str {
        "network"
    }

    fn can_handle(&self, error: &UiError) -> bool {
        error.category == ErrorCategory::Network
    }

    async fn handle(&self, error: &UiError, context: &RecoveryContext) -> RecoveryResult {
        match error.code {
            ErrorCode::RequestAborted => RecoveryResult::of(RecoveryAction::Ignore, true),
            ErrorCode::Offline => RecoveryResult::of(RecoveryAction::QueueOffline, true)
                .with_message(error.message.clone()),
            _ if context.retry_count >= self.max_retries => {
                RecoveryResult::of(RecoveryAction::QueueOffline, true)
                    .with_message("Saved for later. It will be sent when the connection returns.")
            },
            _ => RecoveryResult::retry(self.delay(context.retry_count)),
        }
    }
}

/// Session refresh, re-login and permission errors.
pub struct AuthStrategy {
    gate: Arc<RefreshGate>,
}

impl AuthStrategy {
    #[must_use]
    pub const fn new(gate: Arc<RefreshGate>) -> Self {
        Self { gate }
    }
}

#[async_trait]
impl RecoveryStrategy for AuthStrategy {
    fn name(&self) -> &'static str {
        "auth"
    }

    fn can_handle(&self, error: &UiError) -> bool {
        matches!(
            error.category,
            ErrorCategory::Authentication | ErrorCategory::Authorization
        )
    }

    async fn handle(&self, error: &UiError, _context: &RecoveryContext) -> RecoveryResult {
        match error.code {
            ErrorCode::SessionExpired => match self.gate.refresh().await {
                Ok(()) => RecoveryResult::retry(Duration::ZERO),
                // Could not reach the auth server; the refresh is still owed.
                Err(e) if classify(&e).category == ErrorCategory::Network => {
                    RecoveryResult::of(RecoveryAction::RefreshToken, false)
                        .with_message(error.message.clone())
                },
                Err(_) => RecoveryResult::of(RecoveryAction::RedirectLogin, false)
                    .with_message(ErrorCode::Unauthorized.user_message())
                    .needing_user(),
            },
            ErrorCode::Forbidden => RecoveryResult::show_error(error.message.clone(), true),
            _ => RecoveryResult::of(RecoveryAction::RedirectLogin, false)
                .with_message(error.message.clone())
                .needing_user(),
        }
    }
}

/// Honors `Retry-After`, else walks a fixed schedule.
pub struct RateLimitStrategy {
    schedule: Vec<Duration>,
}

impl RateLimitStrategy {
    #[must_use]
    pub fn new(config: &RecoveryConfig) -> Self {
        Self {
            schedule: config
                .rate_limit_schedule_secs
                .iter()
                .copied()
                .map(Duration::from_secs)
                .collect(),
        }
    }

    fn scheduled_delay(&self, retry_count: u32) -> Duration {
        let index = usize::try_from(retry_count).unwrap_or(usize::MAX);
        self.schedule
            .get(index)
            .or_else(|| self.schedule.last())
            .copied()
            .unwrap_or(Duration::from_secs(60))
    }
}

#[async_trait]
impl RecoveryStrategy for RateLimitStrategy {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    fn can_handle(&self, error: &UiError) -> bool {
        error.category == ErrorCategory::RateLimit
    }

    async fn handle(&self, error: &UiError, context: &RecoveryContext) -> RecoveryResult {
        let delay = error
            .retry_after
            .unwrap_or_else(|| self.scheduled_delay(context.retry_count));
        RecoveryResult::retry(delay).with_message(error.message.clone())
    }
}

/// Bad input and conflicts: never retried.
pub struct ValidationStrategy;

#[async_trait]
impl RecoveryStrategy for ValidationStrategy {
    fn name(&self) -> &'static str {
        "validation"
    }

    fn can_handle(&self, error: &UiError) -> bool {
        matches!(
            error.category,
            ErrorCategory::Validation | ErrorCategory::DataConflict
        )
    }

    async fn handle(&self, error: &UiError, _context: &RecoveryContext) -> RecoveryResult {
        RecoveryResult::show_error(error.message.clone(), true)
    }
}

/// A few linear retries, then cached data if there is any.
pub struct ServerStrategy {
    max_retries: u32,
    step: Duration,
}

impl ServerStrategy {
    #[must_use]
    pub const fn new(config: &RecoveryConfig) -> Self {
        Self {
            max_retries: config.server_max_retries,
            step: Duration::from_millis(config.server_retry_delay_ms),
        }
    }
}

#[async_trait]
impl RecoveryStrategy for ServerStrategy {
    fn name(&self) -> &'static str {
        "server"
    }

    fn can_handle(&self, error: &UiError) -> bool {
        matches!(error.category, ErrorCategory::Server | ErrorCategory::Unknown)
    }

    async fn handle(&self, error: &UiError, context: &RecoveryContext) -> RecoveryResult {
        if context.retry_count < self.max_retries {
            return RecoveryResult::retry(self.step.saturating_mul(context.retry_count + 1));
        }
        match &context.cached_data {
            Some(data) => RecoveryResult {
                fallback_data: Some(data.clone()),
                message: Some("Showing saved data while the server recovers.".to_string()),
                ..RecoveryResult::of(RecoveryAction::UseCachedData, true)
            },
            None => RecoveryResult::show_error(error.message.clone(), false),
        }
    }
}

/// The standard strategy set, in matching order.
#[must_use]
pub fn default_strategies(
    config: &RecoveryConfig,
    gate: Arc<RefreshGate>,
) -> Vec<Box<dyn RecoveryStrategy>> {
    vec![
        Box::new(NetworkStrategy::new(config)),
        Box::new(AuthStrategy::new(gate)),
        Box::new(RateLimitStrategy::new(config)),
        Box::new(ValidationStrategy),
        Box::new(ServerStrategy::new(config)),
    ]
}
