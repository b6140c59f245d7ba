//! Checkout-to-order pipeline.
//!
//! [`CheckoutPipeline`] is the entry point used by the HTTP handlers:
//! `create_checkout_session` opens a payment session for a set of products,
//! and `checkout_success` turns a paid session into exactly one order.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::CheckoutConfig;
use crate::errors::ServiceError;
use crate::events::EventSender;
use crate::payments::PaymentProvider;
use crate::repositories::Stores;
use crate::services::coupons::{CouponDiscountResolver, RewardPolicy};

pub mod finalizer;
pub mod line_items;
pub mod metadata;
pub mod session;

pub use finalizer::{FinalizationOutcome, OrderFinalizer};
pub use line_items::{LineItem, LineItemBatch, ResolvedCartProduct};
pub use metadata::{CheckoutMetadata, SnapshotProduct};
pub use session::{
    CheckoutProduct, CheckoutSessionInitiator, CheckoutSessionResponse,
    CreateCheckoutSessionRequest,
};

const ORDER_CREATED_MESSAGE: &str = "Payment successful, order created, and coupon deactivated if used.";
const ORDER_EXISTS_MESSAGE: &str = "Order already exists for this session.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSuccessResponse {
    pub success: bool,
    pub message: String,
    pub order_id: Uuid,
    pub order_number: i64,
}

impl From<FinalizationOutcome> for CheckoutSuccessResponse {
    fn from(outcome: FinalizationOutcome) -> Self {
        let message = if outcome.was_created() {
            ORDER_CREATED_MESSAGE
        } else {
            ORDER_EXISTS_MESSAGE
        };
        let order = outcome.order();
        Self {
            success: true,
            message: message.to_string(),
            order_id: order.id,
            order_number: order.order_number,
        }
    }
}

#[derive(Clone)]
pub struct CheckoutPipeline {
    initiator: CheckoutSessionInitiator,
    finalizer: OrderFinalizer,
    coupons: CouponDiscountResolver,
}

impl CheckoutPipeline {
    pub fn new(
        stores: Stores,
        provider: Arc<dyn PaymentProvider>,
        config: Arc<CheckoutConfig>,
        events: EventSender,
    ) -> Self {
        let coupons = CouponDiscountResolver::new(
            stores.coupons.clone(),
            RewardPolicy::from(config.as_ref()),
            events.clone(),
        );
        let initiator = CheckoutSessionInitiator::new(
            stores.catalog.clone(),
            coupons.clone(),
            provider.clone(),
            config.clone(),
            events.clone(),
        );
        let finalizer = OrderFinalizer::new(
            provider,
            stores.orders,
            stores.carts,
            stores.catalog,
            coupons.clone(),
            config,
            events,
        );

        Self {
            initiator,
            finalizer,
            coupons,
        }
    }

    pub async fn create_checkout_session(
        &self,
        user_id: Uuid,
        request: CreateCheckoutSessionRequest,
    ) -> Result<CheckoutSessionResponse, ServiceError> {
        self.initiator
            .create_checkout_session(user_id, request)
            .await
    }

    pub async fn create_checkout_session_with_key(
        &self,
        user_id: Uuid,
        request: CreateCheckoutSessionRequest,
        client_key: Option<&str>,
    ) -> Result<CheckoutSessionResponse, ServiceError> {
        self.initiator
            .create_checkout_session_with_key(user_id, request, client_key)
            .await
    }

    pub async fn checkout_success(
        &self,
        session_id: &str,
    ) -> Result<CheckoutSuccessResponse, ServiceError> {
        self.finalizer
            .checkout_success(session_id)
            .await
            .map(CheckoutSuccessResponse::from)
    }

    pub fn coupons(&self) -> &CouponDiscountResolver {
        &self.coupons
    }
}
