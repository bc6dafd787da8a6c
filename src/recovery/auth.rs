//! Token refresh collaborator and in-flight deduplication.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::transport::TransportError;

/// Obtains a fresh session token.
///
/// Token issuance lives outside this crate; implementations typically call
/// an auth endpoint and hand the new token to the transport.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Refresh the session.
    ///
    /// # Errors
    ///
    /// Returns the transport failure that prevented the refresh.
    async fn refresh(&self) -> Result<(), TransportError>;
}

/// Refresher used when no auth collaborator is wired in. Always fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableRefresher;

#[async_trait]
impl TokenRefresher for UnavailableRefresher {
    async fn refresh(&self) -> Result<(), TransportError> {
        Err(TransportError::Http {
            status: 401,
            code: Some("TOKEN_INVALID".to_string()),
            message: "no token refresher configured".to_string(),
            retry_after: None,
            body: serde_json::Value::Null,
        })
    }
}

type Flight = Arc<OnceCell<Result<(), TransportError>>>;

/// Collapses concurrent refresh attempts into one.
///
/// Callers that arrive while a refresh is running wait for it and share its
/// outcome instead of starting another. The flight is retired once its
/// outcome is known, so the next caller starts a fresh refresh.
pub struct RefreshGate {
    refresher: Arc<dyn TokenRefresher>,
    flight: Mutex<Option<Flight>>,
}

impl RefreshGate {
    #[must_use]
    pub fn new(refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            refresher,
            flight: Mutex::new(None),
        }
    }

    /// Refresh the session, joining a refresh already in flight.
    ///
    /// # Errors
    ///
    /// Returns the failure of the refresh this call ran or joined.
    pub async fn refresh(&self) -> Result<(), TransportError> {
        let flight = Arc::clone(
            self.flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get_or_insert_with(|| Arc::new(OnceCell::new())),
        );

        let outcome = flight
            .get_or_init(|| async {
                tracing::info!("refreshing session token");
                let outcome = self.refresher.refresh().await;
                if let Err(e) = &outcome {
                    tracing::warn!(error = %e, "session refresh failed");
                }
                outcome
            })
            .await
            .clone();

        let mut current = self.flight.lock().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &flight)) {
            *current = None;
        }
        outcome
    }
}
