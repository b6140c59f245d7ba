use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::config::CheckoutConfig;
use crate::entities::ProductModel;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::money;
use crate::payments::{CreateSessionRequest, DiscountDescriptor, PaymentProvider};
use crate::repositories::ProductCatalog;
use crate::services::coupons::CouponDiscountResolver;

use super::line_items::{self, effective_quantity, ResolvedCartProduct};
use super::metadata::{CheckoutMetadata, SnapshotProduct};

/// One product in a checkout request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutProduct {
    pub id: Uuid,
    #[serde(default)]
    pub quantity: Option<i32>,
    pub price: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateCheckoutSessionRequest {
    #[serde(default)]
    #[validate(length(min = 1, message = "products must not be empty"))]
    pub products: Vec<CheckoutProduct>,
    #[serde(default)]
    pub coupon_code: Option<String>,
}

/// Session id and the discounted total in major units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSessionResponse {
    pub id: String,
    pub total_amount: Decimal,
}

/// Opens payment sessions for a set of requested products.
#[derive(Clone)]
pub struct CheckoutSessionInitiator {
    catalog: Arc<dyn ProductCatalog>,
    discounts: CouponDiscountResolver,
    provider: Arc<dyn PaymentProvider>,
    config: Arc<CheckoutConfig>,
    events: EventSender,
}

impl CheckoutSessionInitiator {
    pub fn new(
        catalog: Arc<dyn ProductCatalog>,
        discounts: CouponDiscountResolver,
        provider: Arc<dyn PaymentProvider>,
        config: Arc<CheckoutConfig>,
        events: EventSender,
    ) -> Self {
        Self {
            catalog,
            discounts,
            provider,
            config,
            events,
        }
    }

    pub async fn create_checkout_session(
        &self,
        user_id: Uuid,
        request: CreateCheckoutSessionRequest,
    ) -> Result<CheckoutSessionResponse, ServiceError> {
        self.create_checkout_session_with_key(user_id, request, None)
            .await
    }

    /// Like [`create_checkout_session`](Self::create_checkout_session), with a
    /// client retry key. Repeating the same key and basket reuses the session.
    #[instrument(skip(self, request, client_key), fields(products = request.products.len()))]
    pub async fn create_checkout_session_with_key(
        &self,
        user_id: Uuid,
        request: CreateCheckoutSessionRequest,
        client_key: Option<&str>,
    ) -> Result<CheckoutSessionResponse, ServiceError> {
        request.validate()?;
        let client_key = client_key.map(str::trim);
        if let Some(key) = client_key {
            if key.is_empty() || key.len() > MAX_CLIENT_KEY_LEN {
                return Err(ServiceError::BadRequest(format!(
                    "idempotency key must be 1 to {} characters",
                    MAX_CLIENT_KEY_LEN
                )));
            }
        }

        let resolved = self.resolve_products(&request.products).await?;
        let batch = line_items::build(&resolved)?;

        let coupon_code = request
            .coupon_code
            .as_deref()
            .map(str::trim)
            .filter(|code| !code.is_empty());
        let discount = self
            .discounts
            .apply_discount(batch.initial_total_cents, coupon_code, user_id)
            .await;

        // Reward eligibility is judged on the pre-discount amount.
        let _reward = self
            .discounts
            .spawn_reward_grant(user_id, batch.initial_total_cents);

        let snapshot = CheckoutMetadata {
            user_id,
            coupon_code: discount.applied_coupon.as_ref().map(|c| c.code.clone()),
            products: request
                .products
                .iter()
                .map(|p| SnapshotProduct {
                    id: p.id,
                    quantity: effective_quantity(p.quantity),
                    price: p.price,
                })
                .collect(),
        };

        let metadata = snapshot.to_metadata()?;
        let session = self
            .provider
            .create_session(CreateSessionRequest {
                line_items: batch.line_items,
                discount: discount
                    .applied_coupon
                    .as_ref()
                    .map(|coupon| DiscountDescriptor {
                        code: coupon.code.clone(),
                        percent_off: coupon.discount_percentage,
                    }),
                currency: self.config.currency.clone(),
                success_url: self.config.success_url.clone(),
                cancel_url: self.config.cancel_url.clone(),
                idempotency_key: idempotency_key(user_id, client_key, &metadata),
                metadata,
                client_reference_id: Some(user_id.to_string()),
            })
            .await?;

        counter!("checkout.sessions_created", 1);
        info!(session_id = %session.id, %user_id, total_cents = discount.total_cents, "checkout session created");
        self.events.send_or_log(Event::CheckoutSessionCreated {
            session_id: session.id.clone(),
            user_id,
            total_cents: discount.total_cents,
        });

        Ok(CheckoutSessionResponse {
            id: session.id,
            total_amount: money::to_major_units(discount.total_cents)?,
        })
    }

    /// Matches requested products against the catalog.
    ///
    /// Every id must exist, the submitted price must equal the catalog price
    /// and the requested quantity must be in stock.
    async fn resolve_products(
        &self,
        requested: &[CheckoutProduct],
    ) -> Result<Vec<ResolvedCartProduct>, ServiceError> {
        let mut ids: Vec<Uuid> = requested.iter().map(|p| p.id).collect();
        ids.sort();
        ids.dedup();

        let catalog: HashMap<Uuid, ProductModel> = self
            .catalog
            .find_by_ids(&ids)
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        let mut wanted: HashMap<Uuid, i64> = HashMap::new();
        let mut resolved = Vec::with_capacity(requested.len());
        for item in requested {
            let product = catalog.get(&item.id).ok_or_else(|| {
                ServiceError::InvalidInput(format!("Product {} not found", item.id))
            })?;

            if money::to_minor_units(item.price)? != product.price_cents {
                return Err(ServiceError::InvalidInput(format!(
                    "Price of product {} has changed",
                    item.id
                )));
            }

            let quantity = effective_quantity(item.quantity);
            let total_wanted = wanted.entry(item.id).or_insert(0);
            *total_wanted += i64::from(quantity);
            if *total_wanted > i64::from(product.stock) {
                return Err(ServiceError::InvalidInput(format!(
                    "Insufficient stock for product {}",
                    item.id
                )));
            }

            resolved.push(ResolvedCartProduct {
                product_id: product.id,
                name: product.name.clone(),
                image: product.image.clone(),
                unit_price: item.price,
                quantity: Some(quantity),
            });
        }

        Ok(resolved)
    }
}

const MAX_CLIENT_KEY_LEN: usize = 200;

/// Idempotency key for session creation.
///
/// With a client key: `checkout-{user}-{digest}` over the client key and the
/// metadata snapshot, so a retried request maps to the same provider session.
/// Without one: `checkout-{user}-{unix millis}`.
fn idempotency_key(
    user_id: Uuid,
    client_key: Option<&str>,
    metadata: &HashMap<String, String>,
) -> String {
    let Some(client_key) = client_key else {
        return format!("checkout-{}-{}", user_id, Utc::now().timestamp_millis());
    };

    let mut entries: Vec<_> = metadata.iter().collect();
    entries.sort();

    let mut hasher = Sha256::new();
    hasher.update(client_key.as_bytes());
    for (key, value) in entries {
        hasher.update([0u8]);
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update(value.as_bytes());
    }
    let digest = hasher.finalize();
    format!("checkout-{}-{}", user_id, hex::encode(&digest[..16]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use crate::payments::{MockPaymentProvider, ProviderSession};
    use crate::repositories::{InMemoryCatalog, InMemoryCouponStore};
    use crate::services::coupons::RewardPolicy;
    use rust_decimal_macros::dec;

    fn product(price_cents: i64, stock: i32) -> ProductModel {
        let now = Utc::now();
        ProductModel {
            id: Uuid::new_v4(),
            name: "Headphones".into(),
            image: Some("headphones.jpg".into()),
            price_cents,
            stock,
            created_at: now,
            updated_at: now,
        }
    }

    fn initiator(
        catalog: InMemoryCatalog,
        provider: MockPaymentProvider,
    ) -> CheckoutSessionInitiator {
        let (events, _rx) = events::channel(16);
        let config = CheckoutConfig::default();
        let discounts = CouponDiscountResolver::new(
            Arc::new(InMemoryCouponStore::new()),
            RewardPolicy::from(&config),
            events.clone(),
        );
        CheckoutSessionInitiator::new(
            Arc::new(catalog),
            discounts,
            Arc::new(provider),
            Arc::new(config),
            events,
        )
    }

    fn request(products: Vec<CheckoutProduct>) -> CreateCheckoutSessionRequest {
        CreateCheckoutSessionRequest {
            products,
            coupon_code: None,
        }
    }

    #[tokio::test]
    async fn empty_product_list_fails_before_provider_call() {
        let mut provider = MockPaymentProvider::new();
        provider.expect_create_session().never();

        let err = initiator(InMemoryCatalog::new(), provider)
            .create_checkout_session(Uuid::new_v4(), request(Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::ValidationError(_)));
    }

    #[tokio::test]
    async fn unknown_product_or_changed_price_is_rejected() {
        let known = product(2500, 5);
        let catalog = InMemoryCatalog::with_products([known.clone()]);
        let mut provider = MockPaymentProvider::new();
        provider.expect_create_session().never();
        let initiator = initiator(catalog, provider);

        let unknown = initiator
            .create_checkout_session(
                Uuid::new_v4(),
                request(vec![CheckoutProduct {
                    id: Uuid::new_v4(),
                    quantity: Some(1),
                    price: dec!(25),
                }]),
            )
            .await;
        assert!(matches!(unknown, Err(ServiceError::InvalidInput(_))));

        let repriced = initiator
            .create_checkout_session(
                Uuid::new_v4(),
                request(vec![CheckoutProduct {
                    id: known.id,
                    quantity: Some(1),
                    price: dec!(1.00),
                }]),
            )
            .await;
        assert!(matches!(repriced, Err(ServiceError::InvalidInput(_))));

        let too_many = initiator
            .create_checkout_session(
                Uuid::new_v4(),
                request(vec![CheckoutProduct {
                    id: known.id,
                    quantity: Some(6),
                    price: dec!(25.00),
                }]),
            )
            .await;
        assert!(matches!(too_many, Err(ServiceError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn passes_line_items_snapshot_and_key_to_provider() {
        let lamp = product(4999, 10);
        let catalog = InMemoryCatalog::with_products([lamp.clone()]);
        let user_id = Uuid::new_v4();
        let lamp_id = lamp.id;

        let mut provider = MockPaymentProvider::new();
        provider
            .expect_create_session()
            .times(1)
            .withf(move |req| {
                req.line_items.len() == 1
                    && req.line_items[0].unit_amount_cents == 4999
                    && req.line_items[0].quantity == 2
                    && req.line_items[0].name == "Headphones"
                    && req.discount.is_none()
                    && req.metadata["userId"] == user_id.to_string()
                    && req.metadata["couponCode"].is_empty()
                    && req.metadata["products"].contains(&lamp_id.to_string())
                    && req
                        .idempotency_key
                        .starts_with(&format!("checkout-{}-", user_id))
            })
            .returning(|_| {
                Ok(ProviderSession {
                    id: "cs_test_1".into(),
                    url: None,
                })
            });

        let response = initiator(catalog, provider)
            .create_checkout_session(
                user_id,
                CreateCheckoutSessionRequest {
                    products: vec![CheckoutProduct {
                        id: lamp_id,
                        quantity: Some(2),
                        price: dec!(49.99),
                    }],
                    coupon_code: Some("BOGUS".into()),
                },
            )
            .await
            .unwrap();

        assert_eq!(response.id, "cs_test_1");
        assert_eq!(response.total_amount, dec!(99.98));
    }

    #[tokio::test]
    async fn provider_failure_propagates() {
        let lamp = product(1000, 1);
        let catalog = InMemoryCatalog::with_products([lamp.clone()]);
        let mut provider = MockPaymentProvider::new();
        provider
            .expect_create_session()
            .times(1)
            .returning(|_| Err(ServiceError::ExternalServiceError("card network down".into())));

        let err = initiator(catalog, provider)
            .create_checkout_session(
                Uuid::new_v4(),
                request(vec![CheckoutProduct {
                    id: lamp.id,
                    quantity: None,
                    price: dec!(10),
                }]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::ExternalServiceError(_)));
    }

    #[test]
    fn client_key_gives_a_stable_idempotency_key() {
        let user_id = Uuid::new_v4();
        let metadata = HashMap::from([
            ("userId".to_string(), user_id.to_string()),
            ("products".to_string(), "[]".to_string()),
        ]);

        let first = idempotency_key(user_id, Some("retry-1"), &metadata);
        assert_eq!(first, idempotency_key(user_id, Some("retry-1"), &metadata));
        assert!(first.starts_with(&format!("checkout-{}-", user_id)));

        assert_ne!(first, idempotency_key(user_id, Some("retry-2"), &metadata));
        let mut other_basket = metadata.clone();
        other_basket.insert("products".to_string(), "[1]".to_string());
        assert_ne!(first, idempotency_key(user_id, Some("retry-1"), &other_basket));
        assert_ne!(first, idempotency_key(Uuid::new_v4(), Some("retry-1"), &metadata));
    }

    #[tokio::test]
    async fn blank_or_oversized_client_key_is_rejected() {
        let lamp = product(1000, 1);
        let catalog = InMemoryCatalog::with_products([lamp.clone()]);
        let mut provider = MockPaymentProvider::new();
        provider.expect_create_session().times(0);
        let initiator = initiator(catalog, provider);

        for key in ["   ".to_string(), "k".repeat(MAX_CLIENT_KEY_LEN + 1)] {
            let err = initiator
                .create_checkout_session_with_key(
                    Uuid::new_v4(),
                    request(vec![CheckoutProduct {
                        id: lamp.id,
                        quantity: None,
                        price: dec!(10),
                    }]),
                    Some(&key),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, ServiceError::BadRequest(_)));
        }
    }
}
