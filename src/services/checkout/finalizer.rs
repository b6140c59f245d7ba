use metrics::counter;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::CheckoutConfig;
use crate::entities::{OrderModel, ProductModel};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::money;
use crate::payments::{PaymentProvider, RetrievedSession};
use crate::repositories::{CartStore, NewOrder, NewOrderItem, OrderStore, ProductCatalog};
use crate::services::coupons::CouponDiscountResolver;

use super::metadata::CheckoutMetadata;

const MAX_SESSION_ID_LEN: usize = 255;

/// How a confirmation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizationOutcome {
    /// This call created the order.
    Created(OrderModel),
    /// An order for the session already existed, from an earlier or
    /// concurrent confirmation.
    AlreadyExisted(OrderModel),
}

impl FinalizationOutcome {
    pub fn order(&self) -> &OrderModel {
        match self {
            Self::Created(order) | Self::AlreadyExisted(order) => order,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Turns a paid payment session into exactly one order.
///
/// The unique index on the order's payment session id is what makes this
/// safe under concurrent confirmations; the up-front lookup only saves work
/// on the common duplicate path.
#[derive(Clone)]
pub struct OrderFinalizer {
    provider: Arc<dyn PaymentProvider>,
    orders: Arc<dyn OrderStore>,
    carts: Arc<dyn CartStore>,
    catalog: Arc<dyn ProductCatalog>,
    coupons: CouponDiscountResolver,
    config: Arc<CheckoutConfig>,
    events: EventSender,
}

impl OrderFinalizer {
    pub fn new(
        provider: Arc<dyn PaymentProvider>,
        orders: Arc<dyn OrderStore>,
        carts: Arc<dyn CartStore>,
        catalog: Arc<dyn ProductCatalog>,
        coupons: CouponDiscountResolver,
        config: Arc<CheckoutConfig>,
        events: EventSender,
    ) -> Self {
        Self {
            provider,
            orders,
            carts,
            catalog,
            coupons,
            config,
            events,
        }
    }

    #[instrument(skip(self))]
    pub async fn checkout_success(
        &self,
        session_id: &str,
    ) -> Result<FinalizationOutcome, ServiceError> {
        let session_id = session_id.trim();
        if session_id.is_empty()
            || session_id.len() > MAX_SESSION_ID_LEN
            || session_id.chars().any(char::is_whitespace)
        {
            return Err(ServiceError::InvalidInput("sessionId is malformed".to_string()));
        }

        let session = self.provider.retrieve_session(session_id).await?;
        if !session.payment_status.is_paid() {
            return Err(ServiceError::PaymentNotCompleted(format!(
                "payment status for session {} is {}",
                session_id,
                session.payment_status.as_str()
            )));
        }

        if let Some(existing) = self.orders.find_by_payment_session(session_id).await? {
            counter!("checkout.duplicate_confirmations", 1);
            debug!(order_id = %existing.id, "order already exists for session");
            return Ok(FinalizationOutcome::AlreadyExisted(existing));
        }

        let snapshot = CheckoutMetadata::from_metadata(&session.metadata).map_err(|err| {
            error!(%session_id, error = %err, "checkout session metadata is corrupted");
            err
        })?;

        if let Some(code) = snapshot.coupon_code.as_deref() {
            match self.coupons.consume(code, snapshot.user_id).await {
                Ok(true) => debug!(%code, "coupon consumed"),
                Ok(false) => debug!(%code, "coupon was already inactive"),
                Err(err) => warn!(
                    %code,
                    user_id = %snapshot.user_id,
                    %session_id,
                    error = %err,
                    "coupon deactivation failed; creating order anyway"
                ),
            }
        }

        let new_order = self.build_order(session_id, &session, &snapshot).await?;
        let created = match self.orders.create(new_order).await {
            Ok(created) => created,
            Err(ServiceError::DuplicatePaymentSession(_)) => {
                counter!("checkout.race_recoveries", 1);
                info!(%session_id, "concurrent confirmation created the order first");
                let existing = self
                    .orders
                    .find_by_payment_session(session_id)
                    .await?
                    .ok_or_else(|| {
                        ServiceError::InternalError(format!(
                            "order for session {} conflicted but cannot be found",
                            session_id
                        ))
                    })?;
                return Ok(FinalizationOutcome::AlreadyExisted(existing));
            }
            Err(err) => return Err(err),
        };

        let order = created.order;
        counter!("checkout.orders_created", 1);
        info!(
            order_id = %order.id,
            order_number = order.order_number,
            user_id = %order.user_id,
            "order created from checkout session"
        );
        self.events.send_or_log(Event::OrderCreated {
            order_id: order.id,
            order_number: order.order_number,
            user_id: order.user_id,
            payment_session_id: order.payment_session_id.clone(),
        });

        if let Err(err) = self.carts.clear(snapshot.user_id).await {
            warn!(
                user_id = %snapshot.user_id,
                %session_id,
                error = %err,
                "cart clearing failed after order creation"
            );
        }

        Ok(FinalizationOutcome::Created(order))
    }

    /// Builds the order from the snapshot and the amount the provider charged.
    async fn build_order(
        &self,
        session_id: &str,
        session: &RetrievedSession,
        snapshot: &CheckoutMetadata,
    ) -> Result<NewOrder, ServiceError> {
        let details = self.product_details(snapshot).await;

        let mut items = Vec::with_capacity(snapshot.products.len());
        let mut snapshot_total: i64 = 0;
        for product in &snapshot.products {
            let price_cents = money::to_minor_units(product.price).map_err(|e| {
                ServiceError::CorruptedMetadata(format!("price of {}: {}", product.id, e))
            })?;
            snapshot_total = snapshot_total.saturating_add(
                price_cents.saturating_mul(i64::from(product.quantity)),
            );

            let detail = details.get(&product.id);
            items.push(NewOrderItem {
                product_id: product.id,
                quantity: product.quantity,
                price_at_purchase_cents: price_cents,
                name_at_purchase: detail.map(|p| p.name.clone()).unwrap_or_default(),
                image_at_purchase: detail.and_then(|p| p.image.clone()),
            });
        }

        let total_amount_cents = match session.amount_total_cents {
            Some(amount) if amount >= 0 => amount,
            _ => {
                warn!(%session_id, "provider reported no charged amount; using snapshot subtotal");
                snapshot_total
            }
        };

        Ok(NewOrder {
            user_id: snapshot.user_id,
            payment_session_id: session_id.to_string(),
            total_amount_cents,
            currency: self.config.currency.clone(),
            coupon_code: snapshot.coupon_code.clone(),
            items,
        })
    }

    /// Current names and images for the snapshot's products. Best-effort:
    /// products removed since checkout get an empty name.
    async fn product_details(&self, snapshot: &CheckoutMetadata) -> HashMap<Uuid, ProductModel> {
        let ids: Vec<Uuid> = snapshot.products.iter().map(|p| p.id).collect();
        match self.catalog.find_by_ids(&ids).await {
            Ok(products) => products.into_iter().map(|p| (p.id, p)).collect(),
            Err(err) => {
                warn!(error = %err, "catalog lookup failed; order items keep empty names");
                HashMap::new()
            }
        }
    }
}
