//! Storefront checkout service
//!
//! Turns a shopper's product selection into a hosted payment session and a
//! confirmed payment session into exactly one order.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod migrator;
pub mod money;
pub mod payments;
pub mod repositories;
pub mod services;

use axum::{
    extract::{FromRef, State},
    response::Json,
    routing::get,
    Router,
};
use sea_orm::DatabaseConnection;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::auth::AuthConfig;
use crate::config::CheckoutConfig;
use crate::services::CheckoutPipeline;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub pipeline: CheckoutPipeline,
    pub auth: AuthConfig,
    pub checkout: Arc<CheckoutConfig>,
    /// Absent when running on in-memory stores.
    pub db: Option<Arc<DatabaseConnection>>,
}

impl FromRef<AppState> for AuthConfig {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}

/// Full HTTP surface of the service.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .nest("/payments", handlers::payment_routes())
        .nest("/coupons", handlers::coupon_routes())
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let database = match &state.db {
        Some(db) => match db.ping().await {
            Ok(_) => "healthy",
            Err(err) => {
                tracing::warn!(error = %err, "database ping failed");
                "unhealthy"
            }
        },
        None => "in-memory",
    };

    Json(json!({
        "status": if database == "unhealthy" { "unhealthy" } else { "healthy" },
        "version": env!("CARGO_PKG_VERSION"),
        "checks": { "database": database },
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
