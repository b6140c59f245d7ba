use axum::{
    extract::{Json, State},
    http::HeaderMap,
    routing::post,
    Router,
};
use serde::{Deserialize, Serialize};

use crate::auth::AuthUser;
use crate::errors::ServiceError;
use crate::handlers::{webhooks, AppState};
use crate::services::checkout::{
    CheckoutSessionResponse, CheckoutSuccessResponse, CreateCheckoutSessionRequest,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSuccessRequest {
    /// Missing ids are rejected by the finalizer as malformed.
    #[serde(default)]
    pub session_id: String,
}

/// Optional client retry key for session creation.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Open a payment session for the posted products
async fn create_checkout_session(
    State(state): State<AppState>,
    user: AuthUser,
    headers: HeaderMap,
    Json(request): Json<CreateCheckoutSessionRequest>,
) -> Result<Json<CheckoutSessionResponse>, ServiceError> {
    let client_key = headers
        .get(IDEMPOTENCY_HEADER)
        .map(|value| {
            value.to_str().map_err(|_| {
                ServiceError::BadRequest(format!("{} must be visible ASCII", IDEMPOTENCY_HEADER))
            })
        })
        .transpose()?;

    let response = state
        .pipeline
        .create_checkout_session_with_key(user.user_id, request, client_key)
        .await?;
    Ok(Json(response))
}

/// Confirm a payment session and create its order
///
/// Safe to call any number of times for the same session.
async fn checkout_success(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<CheckoutSuccessRequest>,
) -> Result<Json<CheckoutSuccessResponse>, ServiceError> {
    tracing::debug!(user_id = %user.user_id, session_id = %request.session_id, "checkout confirmation");
    let response = state.pipeline.checkout_success(&request.session_id).await?;
    Ok(Json(response))
}

pub fn payment_routes() -> Router<AppState> {
    Router::new()
        .route("/create-checkout-session", post(create_checkout_session))
        .route("/checkout-success", post(checkout_success))
        .route("/webhook", post(webhooks::payment_webhook))
}
