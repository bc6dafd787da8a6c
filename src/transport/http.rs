//! HTTP transport backed by `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;
use tokio::sync::RwLock;

use super::{ApiRequest, ApiResponse, HttpMethod, Transport, TransportError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Sends requests to `base_url + endpoint` with an optional bearer token.
pub struct HttpTransport {
    client: Client,
    base_url: String,
    access_token: RwLock<Option<String>>,
    /// Longest wait the client itself allows, reported on timeouts.
    timeout: Duration,
}

impl HttpTransport {
    /// Create a transport for the given base URL.
    ///
    /// Request deadlines are enforced by the caller; the client only bounds
    /// connection setup.
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self::with_client(client, base_url, CONNECT_TIMEOUT)
    }

    /// Create a transport whose client also bounds each whole request.
    #[must_use]
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Self {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self::with_client(client, base_url, timeout)
    }

    fn with_client(client: Client, base_url: &str, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: RwLock::new(None),
            timeout,
        }
    }

    /// Store the access token used for subsequent requests.
    pub async fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write().await = token;
    }

    fn send_error(&self, e: &reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else if e.is_connect() {
            TransportError::Connection(e.to_string())
        } else {
            TransportError::Other(e.to_string())
        }
    }

    fn url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else {
            format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
        }
    }
}

const fn method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let url = self.url(&request.endpoint);
        let mut builder = self.client.request(method(request.method), &url);

        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(token) = self.access_token.read().await.as_deref() {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| self.send_error(&e))?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        let text = response
            .text()
            .await
            .map_err(|e| match self.send_error(&e) {
                TransportError::Other(message) => TransportError::Connection(message),
                other => other,
            })?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        tracing::debug!(%url, status, "transport reply");

        Ok(ApiResponse {
            status,
            body,
            retry_after,
        })
    }
}
