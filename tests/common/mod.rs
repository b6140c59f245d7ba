#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{self, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::Utc;
use serde_json::Value;
use storefront_checkout::{
    auth::AuthConfig,
    config::CheckoutConfig,
    entities::{CouponModel, ProductModel},
    events,
    payments::{PaymentProvider, SandboxProvider},
    repositories::{
        CouponStore, InMemoryCartStore, InMemoryCatalog, InMemoryCouponStore, InMemoryOrderStore,
        NewCoupon, Stores,
    },
    services::CheckoutPipeline,
    AppState,
};
use tower::ServiceExt;
use uuid::Uuid;

pub const JWT_SECRET: &str = "test_secret_key_for_testing_purposes_only_32chars";
pub const WEBHOOK_SECRET: &str = "whsec_integration_test";

/// Pipeline and router over in-memory stores and the sandbox provider.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub pipeline: CheckoutPipeline,
    pub catalog: Arc<InMemoryCatalog>,
    pub coupons: Arc<InMemoryCouponStore>,
    pub carts: Arc<InMemoryCartStore>,
    pub orders: Arc<InMemoryOrderStore>,
    pub provider: Arc<SandboxProvider>,
    pub auth: AuthConfig,
    pub user_id: Uuid,
    token: String,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(CheckoutConfig {
            payment_provider: "sandbox".to_string(),
            webhook_secret: Some(WEBHOOK_SECRET.to_string()),
            ..CheckoutConfig::default()
        })
    }

    pub fn with_config(config: CheckoutConfig) -> Self {
        let catalog = Arc::new(InMemoryCatalog::new());
        let coupons = Arc::new(InMemoryCouponStore::new());
        let carts = Arc::new(InMemoryCartStore::new());
        let orders = Arc::new(InMemoryOrderStore::new());
        let provider = Arc::new(SandboxProvider::new());

        let stores = Stores {
            catalog: catalog.clone(),
            coupons: coupons.clone(),
            carts: carts.clone(),
            orders: orders.clone(),
        };

        let (event_sender, event_rx) = events::channel(256);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let config = Arc::new(config);
        let pipeline = CheckoutPipeline::new(
            stores,
            provider.clone() as Arc<dyn PaymentProvider>,
            config.clone(),
            event_sender,
        );

        let auth = AuthConfig::new(JWT_SECRET, "storefront-auth", "storefront-api");
        let user_id = Uuid::new_v4();
        let token = auth
            .issue_token(user_id, chrono::Duration::hours(1))
            .expect("issue test token");

        let state = AppState {
            pipeline: pipeline.clone(),
            auth: auth.clone(),
            checkout: config,
            db: None,
        };

        Self {
            router: storefront_checkout::router(state.clone()),
            state,
            pipeline,
            catalog,
            coupons,
            carts,
            orders,
            provider,
            auth,
            user_id,
            token,
            _event_task: event_task,
        }
    }

    /// Bearer token for the default test user.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn token_for(&self, user_id: Uuid) -> String {
        self.auth
            .issue_token(user_id, chrono::Duration::hours(1))
            .expect("issue test token")
    }

    pub fn seed_product(&self, name: &str, price_cents: i64, stock: i32) -> ProductModel {
        let now = Utc::now();
        let product = ProductModel {
            id: Uuid::new_v4(),
            name: name.to_string(),
            image: Some(format!("{}.jpg", name.to_lowercase().replace(' ', "-"))),
            price_cents,
            stock,
            created_at: now,
            updated_at: now,
        };
        self.catalog.insert(product.clone());
        product
    }

    pub async fn seed_coupon(
        &self,
        owner_id: Uuid,
        code: &str,
        discount_percentage: i32,
        valid_for: chrono::Duration,
    ) -> CouponModel {
        self.coupons
            .replace_for_owner(NewCoupon {
                code: code.to_string(),
                owner_id,
                discount_percentage,
                expires_at: Utc::now() + valid_for,
            })
            .await
            .expect("seed coupon")
    }

    /// Polls the coupon store until a reward coupon shows up for `owner_id`.
    pub async fn wait_for_coupon(&self, owner_id: Uuid) -> Option<CouponModel> {
        for _ in 0..50 {
            if let Some(coupon) = self.coupons.all_for_owner(owner_id).into_iter().next() {
                return Some(coupon);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    /// Send a request against the router with an optional bearer token.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);

        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Convenience helper for authenticated JSON requests.
    pub async fn request_authenticated(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> Response {
        self.request(method, uri, body, Some(self.token())).await
    }

    /// Sends a prebuilt request through the router.
    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Posts a raw webhook payload with the given signature header.
    pub async fn post_webhook(&self, payload: &str, signature: Option<&str>) -> Response {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/payments/webhook")
            .header("content-type", "application/json");
        if let Some(sig) = signature {
            builder = builder.header("Stripe-Signature", sig);
        }
        let request = builder
            .body(Body::from(payload.to_string()))
            .expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}
