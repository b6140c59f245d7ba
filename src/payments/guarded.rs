use async_trait::async_trait;
use metrics::counter;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::errors::ServiceError;
use crate::payments::{CreateSessionRequest, PaymentProvider, ProviderSession, RetrievedSession};

/// Bounds every provider call with a timeout.
///
/// Session retrieval is idempotent and gets one extra attempt after a timeout
/// or transient failure. Session creation is never retried here; a client
/// retry reuses the idempotency key instead.
#[derive(Debug, Clone)]
pub struct GuardedProvider<P> {
    inner: P,
    timeout: Duration,
}

impl<P: PaymentProvider> GuardedProvider<P> {
    pub fn new(inner: P, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, ServiceError>>,
    ) -> Result<T, ServiceError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                counter!("payment_provider.timeouts", 1);
                Err(ServiceError::ExternalServiceError(format!(
                    "payment provider {} timed out after {:?}",
                    operation, self.timeout
                )))
            }
        }
    }
}

#[async_trait]
impl<P: PaymentProvider> PaymentProvider for GuardedProvider<P> {
    async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<ProviderSession, ServiceError> {
        self.bounded("create_session", self.inner.create_session(request))
            .await
    }

    async fn retrieve_session(&self, session_id: &str) -> Result<RetrievedSession, ServiceError> {
        match self
            .bounded("retrieve_session", self.inner.retrieve_session(session_id))
            .await
        {
            Err(err) if err.is_transient() => {
                warn!(%session_id, error = %err, "retrying session retrieval");
                counter!("payment_provider.retries", 1);
                self.bounded("retrieve_session", self.inner.retrieve_session(session_id))
                    .await
            }
            other => other,
        }
    }
}
