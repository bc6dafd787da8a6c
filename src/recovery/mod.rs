//! Error classification and recovery.
//!
//! Every failure the engine sees is classified into a [`UiError`] and handed
//! to [`ErrorRecovery`], which asks the first matching [`RecoveryStrategy`]
//! for a [`RecoveryResult`].

mod auth;
mod classifier;
mod orchestrator;
mod strategy;

pub use auth::{RefreshGate, TokenRefresher, UnavailableRefresher};
pub use classifier::{
    classify, classify_message, resolve_code, ErrorCategory, ErrorCode, Severity, UiError,
};
pub use orchestrator::{ErrorRecovery, ListenerId, OfflineRequestOptions, OfflineRunSummary};
pub use strategy::{
    default_strategies, AuthStrategy, NetworkStrategy, RateLimitStrategy, RecoveryAction,
    RecoveryContext, RecoveryResult, RecoveryStrategy, ServerStrategy, ValidationStrategy,
};

#[cfg(test)]
pub(crate) use auth::MockTokenRefresher;
