use axum::{
    extract::{Json, State},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use validator::Validate;

use crate::auth::AuthUser;
use crate::entities::CouponModel;
use crate::errors::ServiceError;
use crate::handlers::AppState;
use crate::services::coupons::{CouponValidation, ValidateCouponRequest};

/// A user's active coupon as returned by `GET /coupons`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CouponResponse {
    pub code: String,
    pub discount_percentage: i32,
    pub expires_at: DateTime<Utc>,
}

impl From<CouponModel> for CouponResponse {
    fn from(coupon: CouponModel) -> Self {
        Self {
            code: coupon.code,
            discount_percentage: coupon.discount_percentage,
            expires_at: coupon.expires_at,
        }
    }
}

/// Check a coupon code before checkout
///
/// Unlike checkout, this reports unknown and expired coupons as errors.
async fn validate_coupon(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<ValidateCouponRequest>,
) -> Result<Json<CouponValidation>, ServiceError> {
    request.validate()?;
    let validation = state
        .pipeline
        .coupons()
        .validate_coupon(&request.code, user.user_id)
        .await?;
    Ok(Json(validation))
}

/// The caller's current active coupon, or `null`
async fn get_coupon(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Option<CouponResponse>>, ServiceError> {
    let coupon = state.pipeline.coupons().active_coupon(user.user_id).await?;
    Ok(Json(coupon.map(CouponResponse::from)))
}

pub fn coupon_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(get_coupon))
        .route("/validate", post(validate_coupon))
}
