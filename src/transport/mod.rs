//! Request/response transport used by the sync engine.
//!
//! The engine never talks HTTP directly. It hands an [`ApiRequest`] to a
//! [`Transport`] and receives an [`ApiResponse`] for any HTTP reply, or a
//! [`TransportError`] when no reply could be obtained. [`send`] layers the
//! per-request timeout and the cancellation signal on top.

mod http;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;

pub use http::HttpTransport;

/// HTTP method of a queued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    /// Wire name of the method.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            other => Err(format!("unsupported HTTP method: {other}")),
        }
    }
}

/// A request handed to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    pub method: HttpMethod,
    pub endpoint: String,
    pub body: Option<Value>,
    pub headers: BTreeMap<String, String>,
}

impl ApiRequest {
    /// A POST with a JSON body.
    #[must_use]
    pub fn post(endpoint: impl Into<String>, body: Value) -> Self {
        Self {
            method: HttpMethod::Post,
            endpoint: endpoint.into(),
            body: Some(body),
            headers: BTreeMap::new(),
        }
    }
}

/// Any HTTP reply, successful or not.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
    /// Parsed `Retry-After` header, when the server sent one.
    pub retry_after: Option<Duration>,
}

impl ApiResponse {
    /// A reply with the given status and body.
    #[must_use]
    pub const fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            body,
            retry_after: None,
        }
    }

    /// Whether the status is in the 2xx range.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Turn a non-2xx reply into a [`TransportError::Http`].
    ///
    /// Structured error bodies (`{"code": ..., "message": ...}` or
    /// `{"error": {"code": ..., "message": ...}}`) are carried through so the
    /// classifier can use the explicit code.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Http` for any status outside 2xx.
    pub fn into_result(self) -> Result<Self, TransportError> {
        if self.is_success() {
            return Ok(self);
        }

        let error_obj = self.body.get("error").filter(|e| e.is_object());
        let field = |name: &str| {
            error_obj
                .and_then(|e| e.get(name))
                .or_else(|| self.body.get(name))
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        let code = field("code");
        let message = field("message")
            .or_else(|| self.body.get("error").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| format!("HTTP {}", self.status));
        let retry_after = self.retry_after.or_else(|| {
            self.body
                .get("retryAfter")
                .and_then(Value::as_u64)
                .map(Duration::from_secs)
        });

        Err(TransportError::Http {
            status: self.status,
            code,
            message,
            retry_after,
            body: self.body,
        })
    }
}

/// Failure to obtain a usable reply.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("request aborted")]
    Aborted,

    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        code: Option<String>,
        message: String,
        retry_after: Option<Duration>,
        body: Value,
    },

    /// Anything else, described only by its message.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// HTTP status, when the failure came from a reply.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// The request/response collaborator.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue a request and return whatever the server replied.
    ///
    /// Implementations return `Ok` for every HTTP reply, including error
    /// statuses, and `Err` only when no reply was received.
    async fn request(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError>;
}

/// Receiving side of a cancellation signal.
///
/// Any change to the watched generation aborts the request in flight.
pub type CancelSignal = watch::Receiver<u64>;

/// Send a request with a deadline, optionally racing a cancellation signal.
///
/// Non-2xx replies are converted with [`ApiResponse::into_result`].
///
/// # Errors
///
/// `Timeout` when the deadline passes, `Aborted` when the signal fires,
/// otherwise whatever the transport or the reply produced.
pub async fn send(
    transport: &dyn Transport,
    request: &ApiRequest,
    timeout: Duration,
    cancel: Option<&mut CancelSignal>,
) -> Result<ApiResponse, TransportError> {
    let call = tokio::time::timeout(timeout, transport.request(request));

    let outcome = match cancel {
        Some(signal) => {
            let cancelled = async {
                // A dropped sender can never cancel.
                if signal.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            };
            tokio::select! {
                biased;
                () = cancelled => return Err(TransportError::Aborted),
                outcome = call => outcome,
            }
        },
        None => call.await,
    };

    match outcome {
        Ok(reply) => reply?.into_result(),
        Err(_) => Err(TransportError::Timeout(timeout)),
    }
}
