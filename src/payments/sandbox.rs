use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use std::collections::HashMap;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::money;
use crate::payments::{
    CreateSessionRequest, PaymentProvider, PaymentStatus, ProviderSession, RetrievedSession,
};

#[derive(Debug, Clone)]
struct SandboxSession {
    status: PaymentStatus,
    metadata: HashMap<String, String>,
    amount_total_cents: i64,
    request: CreateSessionRequest,
}

/// In-process payment provider for local runs and tests.
///
/// Sessions start `unpaid`; [`SandboxProvider::mark_paid`] stands in for the
/// customer completing payment on the hosted page.
#[derive(Debug, Default)]
pub struct SandboxProvider {
    sessions: DashMap<String, SandboxSession>,
    by_idempotency_key: DashMap<String, String>,
}

impl SandboxProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_paid(&self, session_id: &str) -> Result<(), ServiceError> {
        self.set_status(session_id, PaymentStatus::Paid)
    }

    pub fn set_status(&self, session_id: &str, status: PaymentStatus) -> Result<(), ServiceError> {
        let mut session = self.sessions.get_mut(session_id).ok_or_else(|| {
            ServiceError::NotFound(format!("checkout session {} not found", session_id))
        })?;
        session.status = status;
        Ok(())
    }

    /// Overwrites a metadata value, simulating tampering or corruption.
    pub fn overwrite_metadata(
        &self,
        session_id: &str,
        key: &str,
        value: &str,
    ) -> Result<(), ServiceError> {
        let mut session = self.sessions.get_mut(session_id).ok_or_else(|| {
            ServiceError::NotFound(format!("checkout session {} not found", session_id))
        })?;
        session.metadata.insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// The request a session was opened with.
    pub fn request_for(&self, session_id: &str) -> Option<CreateSessionRequest> {
        self.sessions
            .get(session_id)
            .map(|session| session.request.clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn charged_amount(request: &CreateSessionRequest) -> Result<i64, ServiceError> {
        let mut subtotal: i64 = 0;
        for item in &request.line_items {
            let line = money::line_total(item.unit_amount_cents, i64::from(item.quantity))?;
            subtotal = subtotal.checked_add(line).ok_or_else(|| {
                ServiceError::InvalidInput("session total overflows".to_string())
            })?;
        }

        let discount = request
            .discount
            .as_ref()
            .map(|d| money::percentage_of(subtotal, d.percent_off))
            .unwrap_or(0);
        Ok(subtotal - discount)
    }
}

#[async_trait]
impl PaymentProvider for SandboxProvider {
    #[instrument(skip(self, request), fields(idempotency_key = %request.idempotency_key))]
    async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<ProviderSession, ServiceError> {
        let amount_total_cents = Self::charged_amount(&request)?;

        let id = match self.by_idempotency_key.entry(request.idempotency_key.clone()) {
            Entry::Occupied(existing) => {
                debug!(session_id = %existing.get(), "replaying idempotent session");
                existing.get().clone()
            }
            Entry::Vacant(slot) => {
                let id = format!("cs_sandbox_{}", Uuid::new_v4().simple());
                self.sessions.insert(
                    id.clone(),
                    SandboxSession {
                        status: PaymentStatus::Unpaid,
                        metadata: request.metadata.clone(),
                        amount_total_cents,
                        request,
                    },
                );
                slot.insert(id.clone());
                id
            }
        };

        Ok(ProviderSession {
            url: Some(format!("sandbox://checkout/{}", id)),
            id,
        })
    }

    async fn retrieve_session(&self, session_id: &str) -> Result<RetrievedSession, ServiceError> {
        let session = self.sessions.get(session_id).ok_or_else(|| {
            ServiceError::NotFound(format!("checkout session {} not found", session_id))
        })?;

        Ok(RetrievedSession {
            id: session_id.to_string(),
            payment_status: session.status,
            metadata: session.metadata.clone(),
            amount_total_cents: Some(session.amount_total_cents),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::DiscountDescriptor;
    use crate::services::checkout::LineItem;

    fn request(key: &str) -> CreateSessionRequest {
        CreateSessionRequest {
            line_items: vec![
                LineItem {
                    name: "Mug".into(),
                    unit_amount_cents: 1250,
                    quantity: 2,
                    image: None,
                },
                LineItem {
                    name: "Poster".into(),
                    unit_amount_cents: 7500,
                    quantity: 1,
                    image: Some("poster.png".into()),
                },
            ],
            discount: Some(DiscountDescriptor {
                code: "GIFTABCDEF".into(),
                percent_off: 10,
            }),
            currency: "usd".into(),
            success_url: "https://shop.test/success".into(),
            cancel_url: "https://shop.test/cart".into(),
            metadata: HashMap::from([("userId".to_string(), "u1".to_string())]),
            idempotency_key: key.into(),
            client_reference_id: None,
        }
    }

    #[tokio::test]
    async fn sessions_start_unpaid_and_can_be_paid() {
        let provider = SandboxProvider::new();
        let session = provider.create_session(request("k1")).await.unwrap();
        assert!(session.url.unwrap().starts_with("sandbox://checkout/"));

        let retrieved = provider.retrieve_session(&session.id).await.unwrap();
        assert_eq!(retrieved.payment_status, PaymentStatus::Unpaid);
        assert_eq!(retrieved.amount_total_cents, Some(9000));
        assert_eq!(retrieved.metadata["userId"], "u1");

        provider.mark_paid(&session.id).unwrap();
        let retrieved = provider.retrieve_session(&session.id).await.unwrap();
        assert!(retrieved.payment_status.is_paid());
    }

    #[tokio::test]
    async fn repeated_idempotency_key_returns_same_session() {
        let provider = SandboxProvider::new();
        let first = provider.create_session(request("k1")).await.unwrap();
        let again = provider.create_session(request("k1")).await.unwrap();
        let other = provider.create_session(request("k2")).await.unwrap();

        assert_eq!(first.id, again.id);
        assert_ne!(first.id, other.id);
        assert_eq!(provider.session_count(), 2);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let provider = SandboxProvider::new();
        assert!(matches!(
            provider.retrieve_session("cs_missing").await,
            Err(ServiceError::NotFound(_))
        ));
        assert!(provider.mark_paid("cs_missing").is_err());
    }
}
