//! Provider webhooks.
//!
//! `checkout.session.completed` runs the same finalizer as the client-side
//! confirmation, so whichever arrives second finds the existing order.

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::Json,
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::errors::ServiceError;
use crate::handlers::AppState;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

const SESSION_COMPLETED: &str = "checkout.session.completed";
const ASYNC_PAYMENT_SUCCEEDED: &str = "checkout.session.async_payment_succeeded";

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type")]
    event_type: String,
    data: WebhookData,
}

#[derive(Debug, Deserialize)]
struct WebhookData {
    object: Value,
}

// POST /payments/webhook
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ServiceError> {
    if let Some(secret) = state.checkout.webhook_secret.as_deref() {
        let header = headers
            .get(SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| ServiceError::Unauthorized("missing webhook signature".to_string()))?;
        verify_signature(
            header,
            &body,
            secret,
            state.checkout.webhook_tolerance_secs,
            Utc::now().timestamp(),
        )?;
    }

    let event: WebhookEvent = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::BadRequest(format!("invalid webhook payload: {}", e)))?;

    match event.event_type.as_str() {
        SESSION_COMPLETED | ASYNC_PAYMENT_SUCCEEDED => {
            let session_id = event
                .data
                .object
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    ServiceError::BadRequest("webhook event has no session id".to_string())
                })?;

            match state.pipeline.checkout_success(session_id).await {
                Ok(response) => {
                    info!(
                        event_id = event.id.as_deref().unwrap_or_default(),
                        %session_id,
                        order_id = %response.order_id,
                        "webhook confirmed checkout session"
                    );
                }
                // Delayed payment methods complete the session before the
                // money arrives; the async_payment_succeeded event follows.
                Err(ServiceError::PaymentNotCompleted(message)) => {
                    debug!(%session_id, %message, "webhook session not yet paid");
                }
                Err(err) => return Err(err),
            }
        }
        other => debug!(event_type = other, "ignoring webhook event"),
    }

    Ok(Json(json!({ "received": true })))
}

/// Checks a `t=<unix>,v1=<hex hmac>` signature header over `{t}.{body}`.
pub fn verify_signature(
    header: &str,
    payload: &[u8],
    secret: &str,
    tolerance_secs: i64,
    now: i64,
) -> Result<(), ServiceError> {
    let invalid = || ServiceError::Unauthorized("invalid webhook signature".to_string());

    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(invalid)?;
    if now.abs_diff(timestamp) > tolerance_secs.max(0).unsigned_abs() {
        warn!(timestamp, now, "webhook signature outside tolerance");
        return Err(invalid());
    }

    let matched = signatures.iter().any(|candidate| {
        let Ok(expected) = hex::decode(candidate) else {
            return false;
        };
        signing_mac(secret, timestamp, payload)
            .map(|mac| mac.verify_slice(&expected).is_ok())
            .unwrap_or(false)
    });

    if matched {
        Ok(())
    } else {
        warn!("webhook signature verification failed");
        Err(invalid())
    }
}

/// Hex signature for `payload` at `timestamp`, in the format the provider sends.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> Result<String, ServiceError> {
    let mac = signing_mac(secret, timestamp, payload)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn signing_mac(secret: &str, timestamp: i64, payload: &[u8]) -> Result<HmacSha256, ServiceError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ServiceError::InternalError(format!("webhook key rejected: {}", e)))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac)
}
