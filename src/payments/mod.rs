//! Payment provider seam.
//!
//! The pipeline only needs two calls from a provider: open a hosted checkout
//! session and read it back later. Everything provider-specific lives behind
//! [`PaymentProvider`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::ServiceError;
use crate::services::checkout::LineItem;

pub mod guarded;
pub mod sandbox;
pub mod stripe;

pub use guarded::GuardedProvider;
pub use sandbox::SandboxProvider;
pub use stripe::StripeProvider;

/// Payment state of a provider session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Paid,
    Unpaid,
    NoPaymentRequired,
    #[serde(other)]
    Unknown,
}

impl PaymentStatus {
    pub fn is_paid(self) -> bool {
        matches!(self, PaymentStatus::Paid)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Paid => "paid",
            PaymentStatus::Unpaid => "unpaid",
            PaymentStatus::NoPaymentRequired => "no_payment_required",
            PaymentStatus::Unknown => "unknown",
        }
    }
}

/// Percentage discount the provider should apply to the whole session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscountDescriptor {
    pub code: String,
    pub percent_off: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSessionRequest {
    pub line_items: Vec<LineItem>,
    pub discount: Option<DiscountDescriptor>,
    pub currency: String,
    pub success_url: String,
    pub cancel_url: String,
    /// String-only key/value bag stored with the session.
    pub metadata: HashMap<String, String>,
    pub idempotency_key: String,
    pub client_reference_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSession {
    pub id: String,
    /// Hosted checkout page the client is redirected to.
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievedSession {
    pub id: String,
    pub payment_status: PaymentStatus,
    pub metadata: HashMap<String, String>,
    /// Final charged amount after discounts, when the provider reports one.
    pub amount_total_cents: Option<i64>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Opens a checkout session. Not safe to retry without the same
    /// idempotency key.
    async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<ProviderSession, ServiceError>;

    /// Reads a session back. Idempotent.
    async fn retrieve_session(&self, session_id: &str) -> Result<RetrievedSession, ServiceError>;
}

#[async_trait]
impl<P: PaymentProvider + ?Sized> PaymentProvider for Arc<P> {
    async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<ProviderSession, ServiceError> {
        (**self).create_session(request).await
    }

    async fn retrieve_session(&self, session_id: &str) -> Result<RetrievedSession, ServiceError> {
        (**self).retrieve_session(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_statuses_deserialize_as_unknown() {
        let status: PaymentStatus = serde_json::from_str("\"paid\"").unwrap();
        assert!(status.is_paid());
        let status: PaymentStatus = serde_json::from_str("\"processing\"").unwrap();
        assert_eq!(status, PaymentStatus::Unknown);
        assert!(!status.is_paid());
    }
}
