use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::errors::ServiceError;
use crate::payments::{
    CreateSessionRequest, PaymentProvider, PaymentStatus, ProviderSession, RetrievedSession,
};

pub const DEFAULT_API_BASE: &str = "https://api.stripe.com";

/// Checkout Sessions client over the Stripe REST API.
#[derive(Clone)]
pub struct StripeProvider {
    client: reqwest::Client,
    secret_key: String,
    api_base: String,
}

#[derive(Debug, Deserialize)]
struct StripeCoupon {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StripeCheckoutSession {
    id: String,
    #[serde(default)]
    url: Option<String>,
    payment_status: PaymentStatus,
    #[serde(default)]
    metadata: HashMap<String, String>,
    #[serde(default)]
    amount_total: Option<i64>,
}

impl StripeProvider {
    pub fn new(
        secret_key: impl Into<String>,
        api_base: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::InternalError(format!("HTTP client setup failed: {}", e)))?;

        Ok(Self {
            client,
            secret_key: secret_key.into(),
            api_base: api_base
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    /// Creates a single-use percent-off coupon for a session discount.
    async fn create_coupon(
        &self,
        percent_off: i32,
        name: &str,
        idempotency_key: &str,
    ) -> Result<String, ServiceError> {
        let params = vec![
            ("percent_off".to_string(), percent_off.to_string()),
            ("duration".to_string(), "once".to_string()),
            ("name".to_string(), name.to_string()),
        ];

        let response = self
            .client
            .post(self.url("/v1/coupons"))
            .basic_auth(&self.secret_key, Some(""))
            .header("Idempotency-Key", idempotency_key)
            .form(&params)
            .send()
            .await
            .map_err(transport_error)?;

        let coupon: StripeCoupon = parse(response, "coupon").await?;
        Ok(coupon.id)
    }

    fn session_params(
        request: &CreateSessionRequest,
        coupon_id: Option<&str>,
    ) -> Vec<(String, String)> {
        let mut params = vec![
            ("mode".to_string(), "payment".to_string()),
            ("success_url".to_string(), request.success_url.clone()),
            ("cancel_url".to_string(), request.cancel_url.clone()),
        ];

        for (i, item) in request.line_items.iter().enumerate() {
            let prefix = format!("line_items[{}]", i);
            params.push((
                format!("{}[price_data][currency]", prefix),
                request.currency.clone(),
            ));
            params.push((
                format!("{}[price_data][product_data][name]", prefix),
                item.name.clone(),
            ));
            if let Some(image) = &item.image {
                params.push((
                    format!("{}[price_data][product_data][images][0]", prefix),
                    image.clone(),
                ));
            }
            params.push((
                format!("{}[price_data][unit_amount]", prefix),
                item.unit_amount_cents.to_string(),
            ));
            params.push((format!("{}[quantity]", prefix), item.quantity.to_string()));
        }

        if let Some(coupon_id) = coupon_id {
            params.push(("discounts[0][coupon]".to_string(), coupon_id.to_string()));
        }

        if let Some(reference) = &request.client_reference_id {
            params.push(("client_reference_id".to_string(), reference.clone()));
        }

        let mut metadata: Vec<_> = request.metadata.iter().collect();
        metadata.sort();
        for (key, value) in metadata {
            params.push((format!("metadata[{}]", key), value.clone()));
        }

        params
    }
}

fn transport_error(err: reqwest::Error) -> ServiceError {
    ServiceError::ExternalServiceError(format!("Stripe API error: {}", err))
}

async fn parse<T: serde::de::DeserializeOwned>(
    response: Response,
    what: &str,
) -> Result<T, ServiceError> {
    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        warn!(%status, what, "Stripe API error: {}", error_text);
        return Err(match status {
            StatusCode::NOT_FOUND => {
                ServiceError::NotFound(format!("Stripe {} not found", what))
            }
            _ => ServiceError::ExternalServiceError(format!(
                "Stripe {} request failed with {}",
                what, status
            )),
        });
    }

    response.json().await.map_err(|e| {
        ServiceError::ExternalServiceError(format!("Failed to parse Stripe {}: {}", what, e))
    })
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    #[instrument(skip(self, request), fields(idempotency_key = %request.idempotency_key))]
    async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<ProviderSession, ServiceError> {
        let coupon_id = match &request.discount {
            Some(discount) => Some(
                self.create_coupon(
                    discount.percent_off,
                    &discount.code,
                    &format!("{}-coupon", request.idempotency_key),
                )
                .await?,
            ),
            None => None,
        };

        let params = Self::session_params(&request, coupon_id.as_deref());
        let response = self
            .client
            .post(self.url("/v1/checkout/sessions"))
            .basic_auth(&self.secret_key, Some(""))
            .header("Idempotency-Key", &request.idempotency_key)
            .form(&params)
            .send()
            .await
            .map_err(transport_error)?;

        let session: StripeCheckoutSession = parse(response, "checkout session").await?;
        info!(session_id = %session.id, "Stripe checkout session created");

        Ok(ProviderSession {
            id: session.id,
            url: session.url,
        })
    }

    #[instrument(skip(self))]
    async fn retrieve_session(&self, session_id: &str) -> Result<RetrievedSession, ServiceError> {
        let response = self
            .client
            .get(self.url(&format!("/v1/checkout/sessions/{}", session_id)))
            .basic_auth(&self.secret_key, Some(""))
            .send()
            .await
            .map_err(transport_error)?;

        let session: StripeCheckoutSession = parse(response, "checkout session").await?;
        Ok(RetrievedSession {
            id: session.id,
            payment_status: session.payment_status,
            metadata: session.metadata,
            amount_total_cents: session.amount_total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::DiscountDescriptor;
    use crate::services::checkout::LineItem;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> StripeProvider {
        StripeProvider::new("sk_test_123", Some(server.uri()), Duration::from_secs(5)).unwrap()
    }

    fn request(discount: Option<DiscountDescriptor>) -> CreateSessionRequest {
        CreateSessionRequest {
            line_items: vec![LineItem {
                name: "Desk Lamp".into(),
                unit_amount_cents: 4999,
                quantity: 2,
                image: Some("https://cdn.test/lamp.png".into()),
            }],
            discount,
            currency: "usd".into(),
            success_url: "https://shop.test/success?session_id={CHECKOUT_SESSION_ID}".into(),
            cancel_url: "https://shop.test/cart".into(),
            metadata: HashMap::from([
                ("userId".to_string(), "user-1".to_string()),
                ("couponCode".to_string(), String::new()),
            ]),
            idempotency_key: "checkout-user-1-1700000000000".into(),
            client_reference_id: Some("user-1".into()),
        }
    }

    #[tokio::test]
    async fn creates_session_with_form_encoded_line_items() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/checkout/sessions"))
            .and(header("Idempotency-Key", "checkout-user-1-1700000000000"))
            .and(header_exists("authorization"))
            .and(body_string_contains(
                "line_items%5B0%5D%5Bprice_data%5D%5Bunit_amount%5D=4999",
            ))
            .and(body_string_contains("line_items%5B0%5D%5Bquantity%5D=2"))
            .and(body_string_contains("metadata%5BuserId%5D=user-1"))
            .and(body_string_contains("mode=payment"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "cs_test_1",
                "url": "https://checkout.stripe.test/cs_test_1",
                "payment_status": "unpaid",
                "metadata": {}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let session = provider(&server).create_session(request(None)).await.unwrap();
        assert_eq!(session.id, "cs_test_1");
        assert_eq!(
            session.url.as_deref(),
            Some("https://checkout.stripe.test/cs_test_1")
        );
    }

    #[tokio::test]
    async fn discount_creates_single_use_coupon_first() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/coupons"))
            .and(header("Idempotency-Key", "checkout-user-1-1700000000000-coupon"))
            .and(body_string_contains("percent_off=10"))
            .and(body_string_contains("duration=once"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "co_42" })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/checkout/sessions"))
            .and(body_string_contains("discounts%5B0%5D%5Bcoupon%5D=co_42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "cs_test_2",
                "url": null,
                "payment_status": "unpaid"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let session = provider(&server)
            .create_session(request(Some(DiscountDescriptor {
                code: "GIFTABC123".into(),
                percent_off: 10,
            })))
            .await
            .unwrap();
        assert_eq!(session.id, "cs_test_2");
    }

    #[tokio::test]
    async fn retrieves_status_metadata_and_amount() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/checkout/sessions/cs_test_3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "cs_test_3",
                "payment_status": "paid",
                "amount_total": 8998,
                "metadata": { "userId": "user-1", "couponCode": "" }
            })))
            .mount(&server)
            .await;

        let session = provider(&server)
            .retrieve_session("cs_test_3")
            .await
            .unwrap();
        assert!(session.payment_status.is_paid());
        assert_eq!(session.amount_total_cents, Some(8998));
        assert_eq!(session.metadata["userId"], "user-1");
    }

    #[tokio::test]
    async fn maps_not_found_and_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/checkout/sessions/cs_missing"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": { "message": "No such checkout.session" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/checkout/sessions/cs_boom"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let stripe = provider(&server);
        assert!(matches!(
            stripe.retrieve_session("cs_missing").await,
            Err(ServiceError::NotFound(_))
        ));
        let err = stripe.retrieve_session("cs_boom").await.unwrap_err();
        assert!(err.is_transient());
    }
}
