//! Error classification.
//!
//! Maps any failure into a canonical [`UiError`]. Resolution order: an
//! explicit error code from the server, then the HTTP status, then patterns
//! in the message text, then `UNKNOWN_ERROR`. Every code has exactly one
//! category and severity, so classification cannot fail.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::transport::TransportError;

/// Canonical error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NetworkError,
    ConnectionFailed,
    Timeout,
    Offline,
    RequestAborted,
    Unauthorized,
    SessionExpired,
    TokenInvalid,
    Forbidden,
    RateLimited,
    ValidationError,
    BadRequest,
    NotFound,
    Conflict,
    ServerError,
    ServiceUnavailable,
    DatabaseError,
    UnknownError,
}

/// Broad family of an error; each family has exactly one recovery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Authentication,
    Authorization,
    RateLimit,
    Validation,
    Server,
    DataConflict,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [Self; 8] = [
        Self::Network,
        Self::Authentication,
        Self::Authorization,
        Self::RateLimit,
        Self::Validation,
        Self::Server,
        Self::DataConflict,
        Self::Unknown,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorCode {
    pub const ALL: [Self; 18] = [
        Self::NetworkError,
        Self::ConnectionFailed,
        Self::Timeout,
        Self::Offline,
        Self::RequestAborted,
        Self::Unauthorized,
        Self::SessionExpired,
        Self::TokenInvalid,
        Self::Forbidden,
        Self::RateLimited,
        Self::ValidationError,
        Self::BadRequest,
        Self::NotFound,
        Self::Conflict,
        Self::ServerError,
        Self::ServiceUnavailable,
        Self::DatabaseError,
        Self::UnknownError,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NetworkError => "NETWORK_ERROR",
            Self::ConnectionFailed => "CONNECTION_FAILED",
            Self::Timeout => "TIMEOUT",
            Self::Offline => "OFFLINE",
            Self::RequestAborted => "REQUEST_ABORTED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::TokenInvalid => "TOKEN_INVALID",
            Self::Forbidden => "FORBIDDEN",
            Self::RateLimited => "RATE_LIMITED",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::BadRequest => "BAD_REQUEST",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::ServerError => "SERVER_ERROR",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::DatabaseError => "DATABASE_ERROR",
            Self::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// Resolve a code reported by a server, including common aliases.
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        let upper = code.trim().to_ascii_uppercase();
        if let Some(exact) = Self::ALL.into_iter().find(|c| c.as_str() == upper) {
            return Some(exact);
        }
        let alias = match upper.as_str() {
            "TOKEN_EXPIRED" | "JWT_EXPIRED" | "AUTH_SESSION_EXPIRED" => Self::SessionExpired,
            "INVALID_TOKEN" | "JWT_INVALID" => Self::TokenInvalid,
            "TOO_MANY_REQUESTS" => Self::RateLimited,
            "DB_ERROR" => Self::DatabaseError,
            "VALIDATION_FAILED" | "INVALID_INPUT" => Self::ValidationError,
            "INTERNAL_ERROR" | "INTERNAL_SERVER_ERROR" => Self::ServerError,
            "ECONNREFUSED" | "ECONNRESET" => Self::ConnectionFailed,
            "ETIMEDOUT" => Self::Timeout,
            _ => return None,
        };
        Some(alias)
    }

    /// Code implied by an HTTP status.
    #[must_use]
    pub const fn from_status(status: u16) -> Option<Self> {
        let code = match status {
            400 => Self::BadRequest,
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            408 => Self::Timeout,
            409 => Self::Conflict,
            422 => Self::ValidationError,
            429 => Self::RateLimited,
            502..=504 => Self::ServiceUnavailable,
            500..=599 => Self::ServerError,
            400..=499 => Self::BadRequest,
            _ => return None,
        };
        Some(code)
    }

    #[must_use]
    pub const fn category(self) -> ErrorCategory {
        match self {
            Self::NetworkError
            | Self::ConnectionFailed
            | Self::Timeout
            | Self::Offline
            | Self::RequestAborted => ErrorCategory::Network,
            Self::Unauthorized | Self::SessionExpired | Self::TokenInvalid => {
                ErrorCategory::Authentication
            },
            Self::Forbidden => ErrorCategory::Authorization,
            Self::RateLimited => ErrorCategory::RateLimit,
            Self::ValidationError | Self::BadRequest | Self::NotFound => ErrorCategory::Validation,
            Self::Conflict => ErrorCategory::DataConflict,
            Self::ServerError | Self::ServiceUnavailable | Self::DatabaseError => {
                ErrorCategory::Server
            },
            Self::UnknownError => ErrorCategory::Unknown,
        }
    }

    #[must_use]
    pub const fn severity(self) -> Severity {
        match self {
            Self::Offline | Self::RequestAborted | Self::ValidationError => Severity::Low,
            Self::NetworkError
            | Self::ConnectionFailed
            | Self::Timeout
            | Self::SessionExpired
            | Self::RateLimited
            | Self::BadRequest
            | Self::NotFound
            | Self::Conflict
            | Self::UnknownError => Severity::Medium,
            Self::Unauthorized
            | Self::TokenInvalid
            | Self::Forbidden
            | Self::ServerError
            | Self::ServiceUnavailable => Severity::High,
            Self::DatabaseError => Severity::Critical,
        }
    }

    /// Whether retrying the same request can succeed.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        !matches!(
            self,
            Self::Unauthorized
                | Self::TokenInvalid
                | Self::Forbidden
                | Self::NotFound
                | Self::BadRequest
                | Self::ValidationError
                | Self::Conflict
        )
    }

    /// Whether the user has to do something before this can succeed.
    #[must_use]
    pub const fn is_actionable(self) -> bool {
        matches!(
            self,
            Self::Unauthorized
                | Self::TokenInvalid
                | Self::Forbidden
                | Self::ValidationError
                | Self::BadRequest
                | Self::Conflict
        )
    }

    /// Short user-facing explanation.
    #[must_use]
    pub const fn user_message(self) -> &'static str {
        match self {
            Self::NetworkError => "A network error occurred. Check your connection.",
            Self::ConnectionFailed => "Could not reach the server.",
            Self::Timeout => "The server took too long to respond.",
            Self::Offline => "You are offline. Changes will sync when you reconnect.",
            Self::RequestAborted => "The request was cancelled.",
            Self::Unauthorized => "Please sign in again.",
            Self::SessionExpired => "Your session expired.",
            Self::TokenInvalid => "Your sign-in is no longer valid. Please sign in again.",
            Self::Forbidden => "You do not have permission to do that.",
            Self::RateLimited => "Too many requests. Please wait a moment.",
            Self::ValidationError => "Some of the data is invalid.",
            Self::BadRequest => "The request could not be processed.",
            Self::NotFound => "The item no longer exists.",
            Self::Conflict => "This item was changed elsewhere.",
            Self::ServerError => "The server ran into a problem.",
            Self::ServiceUnavailable => "The service is temporarily unavailable.",
            Self::DatabaseError => "The server could not store the data.",
            Self::UnknownError => "Something went wrong.",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical classification of a failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UiError {
    pub code: ErrorCode,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub retryable: bool,
    pub actionable: bool,
    /// User-facing message.
    pub message: String,
    /// Original message, for logs.
    pub technical_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<Duration>,
    pub timestamp: DateTime<Utc>,
}

impl UiError {
    /// Build the record for a code from the static table.
    #[must_use]
    pub fn from_code(code: ErrorCode, technical_message: impl Into<String>) -> Self {
        Self {
            code,
            category: code.category(),
            severity: code.severity(),
            retryable: code.is_retryable(),
            actionable: code.is_actionable(),
            message: code.user_message().to_string(),
            technical_message: technical_message.into(),
            status_code: None,
            retry_after: None,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub const fn with_status(mut self, status: Option<u16>) -> Self {
        self.status_code = status;
        self
    }

    #[must_use]
    pub const fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }
}

fn pattern(re: &str) -> Regex {
    Regex::new(re).unwrap_or_else(|e| panic!("Invalid classifier regex {re}: {e}"))
}

// Checked in order; the first match wins.
static MESSAGE_PATTERNS: Lazy<Vec<(Regex, ErrorCode)>> = Lazy::new(|| {
    vec![
        (pattern(r"(?i)\babort(ed)?\b|\bcancell?ed\b"), ErrorCode::RequestAborted),
        (
            pattern(r"(?i)(session|token|jwt)\s*(has\s+)?expired"),
            ErrorCode::SessionExpired,
        ),
        (pattern(r"(?i)(invalid|malformed)\s+(token|jwt)"), ErrorCode::TokenInvalid),
        (pattern(r"(?i)time[d\s-]*out|etimedout"), ErrorCode::Timeout),
        (
            pattern(r"(?i)connection\s+(refused|reset|closed)|econnrefused|econnreset"),
            ErrorCode::ConnectionFailed,
        ),
        (pattern(r"(?i)\boffline\b|no internet"), ErrorCode::Offline),
        (
            pattern(r"(?i)network|fetch failed|failed to fetch|dns"),
            ErrorCode::NetworkError,
        ),
        (pattern(r"(?i)unauthori[sz]ed|not authenticated"), ErrorCode::Unauthorized),
        (pattern(r"(?i)forbidden|permission denied|access denied"), ErrorCode::Forbidden),
        (pattern(r"(?i)rate.?limit|too many requests"), ErrorCode::RateLimited),
        (pattern(r"(?i)validation|invalid"), ErrorCode::ValidationError),
        (pattern(r"(?i)not found"), ErrorCode::NotFound),
        (pattern(r"(?i)conflict"), ErrorCode::Conflict),
        (pattern(r"(?i)database|sql"), ErrorCode::DatabaseError),
        (
            pattern(r"(?i)server error|internal error|service unavailable"),
            ErrorCode::ServerError,
        ),
    ]
});

static STATUS_IN_TEXT: Lazy<Regex> = Lazy::new(|| pattern(r"\b([1-5]\d{2})\b"));

/// Match a free-text message against the alias table.
#[must_use]
pub fn classify_message(message: &str) -> Option<ErrorCode> {
    MESSAGE_PATTERNS
        .iter()
        .find(|(re, _)| re.is_match(message))
        .map(|(_, code)| *code)
        .or_else(|| {
            STATUS_IN_TEXT
                .captures(message)
                .and_then(|caps| caps[1].parse::<u16>().ok())
                .and_then(ErrorCode::from_status)
        })
}

/// Resolve the code from the pieces a failure may carry.
///
/// A 401 whose message says the session expired is reported as
/// `SESSION_EXPIRED` so it can be refreshed.
#[must_use]
pub fn resolve_code(code: Option<&str>, status: Option<u16>, message: &str) -> ErrorCode {
    if let Some(explicit) = code.and_then(ErrorCode::from_code) {
        return explicit;
    }
    if let Some(from_status) = status.and_then(ErrorCode::from_status) {
        if from_status == ErrorCode::Unauthorized
            && classify_message(message) == Some(ErrorCode::SessionExpired)
        {
            return ErrorCode::SessionExpired;
        }
        return from_status;
    }
    classify_message(message).unwrap_or(ErrorCode::UnknownError)
}

/// Classify a transport failure.
#[must_use]
pub fn classify(error: &TransportError) -> UiError {
    match error {
        TransportError::Timeout(_) => UiError::from_code(ErrorCode::Timeout, error.to_string()),
        TransportError::Connection(message) => {
            let code = match classify_message(message) {
                Some(code) if code.category() == ErrorCategory::Network => code,
                _ => ErrorCode::ConnectionFailed,
            };
            UiError::from_code(code, error.to_string())
        },
        TransportError::Aborted => UiError::from_code(ErrorCode::RequestAborted, error.to_string()),
        TransportError::Http {
            status,
            code,
            message,
            retry_after,
            ..
        } => UiError::from_code(
            resolve_code(code.as_deref(), Some(*status), message),
            message.clone(),
        )
        .with_status(Some(*status))
        .with_retry_after(*retry_after),
        TransportError::Other(message) => UiError::from_code(
            classify_message(message).unwrap_or(ErrorCode::UnknownError),
            message.clone(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    fn http(status: u16, code: Option<&str>, message: &str) -> TransportError {
        TransportError::Http {
            status,
            code: code.map(str::to_string),
            message: message.to_string(),
            retry_after: None,
            body: Value::Null,
        }
    }

    #[test]
    fn test_table_is_total_and_consistent() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::from_code(code.as_str()), Some(code));
            let ui = UiError::from_code(code, "x");
            assert_eq!(ui.category, code.category());
            assert!(!ui.message.is_empty());
        }
    }

    #[test]
    fn test_every_category_has_a_code() {
        for category in ErrorCategory::ALL {
            assert!(ErrorCode::ALL.iter().any(|c| c.category() == category));
        }
    }

    #[test]
    fn test_explicit_code_wins() {
        let ui = classify(&http(401, Some("SESSION_EXPIRED"), "whatever"));
        assert_eq!(ui.code, ErrorCode::SessionExpired);
        assert!(ui.retryable);
        assert_eq!(ui.status_code, Some(401));

        let ui = classify(&http(401, Some("jwt_expired"), "whatever"));
        assert_eq!(ui.code, ErrorCode::SessionExpired);
    }

    #[test]
    fn test_status_aliases() {
        assert_eq!(classify(&http(401, None, "nope")).code, ErrorCode::Unauthorized);
        assert_eq!(classify(&http(403, None, "")).code, ErrorCode::Forbidden);
        assert_eq!(classify(&http(404, None, "")).code, ErrorCode::NotFound);
        assert_eq!(classify(&http(409, None, "")).code, ErrorCode::Conflict);
        assert_eq!(classify(&http(418, None, "")).code, ErrorCode::BadRequest);
        assert_eq!(classify(&http(422, None, "")).code, ErrorCode::ValidationError);
        assert_eq!(classify(&http(429, None, "")).code, ErrorCode::RateLimited);
        assert_eq!(classify(&http(503, None, "")).code, ErrorCode::ServiceUnavailable);
        assert_eq!(classify(&http(507, None, "")).code, ErrorCode::ServerError);
    }

    #[test]
    fn test_unauthorized_with_expired_message() {
        let ui = classify(&http(401, None, "Token has expired"));
        assert_eq!(ui.code, ErrorCode::SessionExpired);
    }

    #[test]
    fn test_transport_failures() {
        assert_eq!(
            classify(&TransportError::Timeout(Duration::from_secs(30))).code,
            ErrorCode::Timeout
        );
        assert_eq!(
            classify(&TransportError::Connection("tcp connect error".to_string())).code,
            ErrorCode::ConnectionFailed
        );
        assert_eq!(classify(&TransportError::Aborted).code, ErrorCode::RequestAborted);
    }

    #[test]
    fn test_message_patterns() {
        assert_eq!(classify_message("fetch failed"), Some(ErrorCode::NetworkError));
        assert_eq!(classify_message("ECONNREFUSED 127.0.0.1"), Some(ErrorCode::ConnectionFailed));
        assert_eq!(classify_message("Permission denied"), Some(ErrorCode::Forbidden));
        assert_eq!(classify_message("Too Many Requests"), Some(ErrorCode::RateLimited));
        assert_eq!(classify_message("upstream said 502"), Some(ErrorCode::ServiceUnavailable));
        assert_eq!(classify_message("mysterious"), None);
    }

    #[test]
    fn test_unknown_fallback() {
        let ui = classify(&TransportError::Other("mysterious".to_string()));
        assert_eq!(ui.code, ErrorCode::UnknownError);
        assert_eq!(ui.category, ErrorCategory::Unknown);
        assert!(ui.retryable);
    }

    #[test]
    fn test_non_retryable_set() {
        let blocked: Vec<_> = ErrorCode::ALL
            .into_iter()
            .filter(|c| !c.is_retryable())
            .collect();
        assert_eq!(
            blocked,
            vec![
                ErrorCode::Unauthorized,
                ErrorCode::TokenInvalid,
                ErrorCode::Forbidden,
                ErrorCode::ValidationError,
                ErrorCode::BadRequest,
                ErrorCode::NotFound,
                ErrorCode::Conflict,
            ]
        );
    }
}
