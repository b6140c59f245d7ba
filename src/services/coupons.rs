use chrono::{Duration, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::config::CheckoutConfig;
use crate::entities::CouponModel;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::money;
use crate::repositories::{CouponStore, NewCoupon};

/// Prefix of generated reward coupon codes
pub const REWARD_CODE_PREFIX: &str = "GIFT";

/// Reward coupon policy, taken from [`CheckoutConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewardPolicy {
    pub threshold_cents: i64,
    pub discount_percentage: i32,
    pub validity: Duration,
}

impl From<&CheckoutConfig> for RewardPolicy {
    fn from(config: &CheckoutConfig) -> Self {
        Self {
            threshold_cents: config.reward_threshold_cents,
            discount_percentage: config.reward_discount_percentage,
            validity: Duration::days(config.reward_validity_days),
        }
    }
}

/// Result of resolving a coupon against a checkout total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscountOutcome {
    pub total_cents: i64,
    pub applied_coupon: Option<CouponModel>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ValidateCouponRequest {
    #[validate(length(min = 1, max = 64))]
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CouponValidation {
    pub code: String,
    pub discount_percentage: i32,
}

/// Looks up and applies per-user percentage coupons, and issues reward
/// coupons for large purchases.
///
/// Checkout uses the lenient [`apply_discount`](Self::apply_discount): a bad
/// code means full price, never an error. The `/coupons/validate` endpoint
/// uses the strict [`validate_coupon`](Self::validate_coupon), which reports
/// and deactivates expired coupons.
#[derive(Clone)]
pub struct CouponDiscountResolver {
    coupons: Arc<dyn CouponStore>,
    policy: RewardPolicy,
    events: EventSender,
}

impl CouponDiscountResolver {
    pub fn new(coupons: Arc<dyn CouponStore>, policy: RewardPolicy, events: EventSender) -> Self {
        Self {
            coupons,
            policy,
            events,
        }
    }

    pub fn policy(&self) -> RewardPolicy {
        self.policy
    }

    /// Applies the user's coupon to `initial_total_cents`, if it is usable.
    ///
    /// Unknown, inactive, foreign or expired codes, and store failures, all
    /// fall back to the undiscounted total.
    #[instrument(skip(self))]
    pub async fn apply_discount(
        &self,
        initial_total_cents: i64,
        coupon_code: Option<&str>,
        user_id: Uuid,
    ) -> DiscountOutcome {
        let undiscounted = DiscountOutcome {
            total_cents: initial_total_cents,
            applied_coupon: None,
        };

        let Some(code) = coupon_code.map(str::trim).filter(|c| !c.is_empty()) else {
            return undiscounted;
        };

        let coupon = match self.coupons.find_active(code, user_id).await {
            Ok(Some(coupon)) if !coupon.is_expired_at(Utc::now()) => coupon,
            Ok(Some(_)) => {
                debug!(%code, "coupon expired; checkout continues at full price");
                return undiscounted;
            }
            Ok(None) => {
                debug!(%code, "coupon not found; checkout continues at full price");
                return undiscounted;
            }
            Err(err) => {
                warn!(%code, %user_id, error = %err, "coupon lookup failed; checkout continues at full price");
                return undiscounted;
            }
        };

        let discount = money::percentage_of(initial_total_cents, coupon.discount_percentage);
        DiscountOutcome {
            total_cents: initial_total_cents - discount,
            applied_coupon: Some(coupon),
        }
    }

    /// Issues a reward coupon when `amount_paid_cents` reaches the threshold.
    ///
    /// Returns the new coupon, or `None` below the threshold. Issuance
    /// replaces whatever coupon the user held before.
    #[instrument(skip(self))]
    pub async fn grant_new_coupon_if_eligible(
        &self,
        user_id: Uuid,
        amount_paid_cents: i64,
    ) -> Result<Option<CouponModel>, ServiceError> {
        if amount_paid_cents < self.policy.threshold_cents {
            return Ok(None);
        }

        let coupon = self
            .coupons
            .replace_for_owner(NewCoupon {
                code: generate_reward_code(),
                owner_id: user_id,
                discount_percentage: self.policy.discount_percentage,
                expires_at: Utc::now() + self.policy.validity,
            })
            .await?;

        counter!("checkout.reward_coupons_issued", 1);
        info!(%user_id, code = %coupon.code, "reward coupon issued");
        self.events.send_or_log(Event::CouponIssued {
            owner_id: user_id,
            code: coupon.code.clone(),
        });
        Ok(Some(coupon))
    }

    /// Runs [`grant_new_coupon_if_eligible`](Self::grant_new_coupon_if_eligible)
    /// on a detached task. Failures are logged and go no further.
    pub fn spawn_reward_grant(
        &self,
        user_id: Uuid,
        amount_paid_cents: i64,
    ) -> tokio::task::JoinHandle<()> {
        let resolver = self.clone();
        tokio::spawn(async move {
            if let Err(err) = resolver
                .grant_new_coupon_if_eligible(user_id, amount_paid_cents)
                .await
            {
                warn!(%user_id, amount_paid_cents, error = %err, "reward coupon issuance failed");
            }
        })
    }

    /// Strict lookup used by the validate endpoint.
    ///
    /// An expired coupon is deactivated before `CouponExpired` is returned.
    #[instrument(skip(self))]
    pub async fn validate_coupon(
        &self,
        code: &str,
        user_id: Uuid,
    ) -> Result<CouponValidation, ServiceError> {
        let coupon = self
            .coupons
            .find_active(code.trim(), user_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Coupon not found".to_string()))?;

        if coupon.is_expired_at(Utc::now()) {
            self.coupons.deactivate(&coupon.code, user_id).await?;
            return Err(ServiceError::CouponExpired(format!(
                "Coupon {} has expired",
                coupon.code
            )));
        }

        Ok(CouponValidation {
            code: coupon.code,
            discount_percentage: coupon.discount_percentage,
        })
    }

    /// The user's current active coupon, if any.
    pub async fn active_coupon(&self, user_id: Uuid) -> Result<Option<CouponModel>, ServiceError> {
        self.coupons.find_active_for_owner(user_id).await
    }

    /// Marks a coupon consumed. Returns whether an active coupon was found.
    pub async fn consume(&self, code: &str, user_id: Uuid) -> Result<bool, ServiceError> {
        let consumed = self.coupons.deactivate(code, user_id).await?;
        if consumed {
            self.events.send_or_log(Event::CouponConsumed {
                owner_id: user_id,
                code: code.to_string(),
            });
        }
        Ok(consumed)
    }
}

/// `GIFT` followed by six uppercase alphanumerics.
fn generate_reward_code() -> String {
    let suffix: String = Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(6)
        .collect::<String>()
        .to_uppercase();
    format!("{}{}", REWARD_CODE_PREFIX, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use crate::repositories::InMemoryCouponStore;
    use rstest::rstest;

    fn resolver(store: Arc<InMemoryCouponStore>) -> CouponDiscountResolver {
        let (events, _rx) = events::channel(16);
        CouponDiscountResolver::new(
            store,
            RewardPolicy {
                threshold_cents: 20_000,
                discount_percentage: 10,
                validity: Duration::days(30),
            },
            events,
        )
    }

    async fn issue(store: &InMemoryCouponStore, owner: Uuid, pct: i32, expires_in: Duration) {
        store
            .replace_for_owner(NewCoupon {
                code: "SAVE10".into(),
                owner_id: owner,
                discount_percentage: pct,
                expires_at: Utc::now() + expires_in,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ten_percent_off_ten_thousand_is_nine_thousand() {
        let store = Arc::new(InMemoryCouponStore::new());
        let user = Uuid::new_v4();
        issue(&store, user, 10, Duration::days(1)).await;

        let outcome = resolver(store)
            .apply_discount(10_000, Some("SAVE10"), user)
            .await;
        assert_eq!(outcome.total_cents, 9_000);
        assert_eq!(outcome.applied_coupon.unwrap().code, "SAVE10");
    }

    #[rstest]
    #[case::no_code(None)]
    #[case::blank_code(Some("  "))]
    #[case::unknown_code(Some("NOPE"))]
    #[tokio::test]
    async fn missing_or_unknown_code_leaves_total_unchanged(#[case] code: Option<&str>) {
        let store = Arc::new(InMemoryCouponStore::new());
        let outcome = resolver(store)
            .apply_discount(10_000, code, Uuid::new_v4())
            .await;
        assert_eq!(outcome.total_cents, 10_000);
        assert!(outcome.applied_coupon.is_none());
    }

    #[tokio::test]
    async fn expired_or_foreign_coupon_is_ignored_at_checkout() {
        let store = Arc::new(InMemoryCouponStore::new());
        let owner = Uuid::new_v4();
        issue(&store, owner, 10, Duration::days(-1)).await;
        let resolver = resolver(store.clone());

        let expired = resolver.apply_discount(10_000, Some("SAVE10"), owner).await;
        assert_eq!(expired.total_cents, 10_000);
        // Lenient path leaves the record untouched.
        assert!(store.all_for_owner(owner)[0].is_active);

        let foreign = resolver
            .apply_discount(10_000, Some("SAVE10"), Uuid::new_v4())
            .await;
        assert_eq!(foreign.total_cents, 10_000);
    }

    #[rstest]
    #[case(20_000, true)]
    #[case(19_999, false)]
    #[case(50_000, true)]
    #[tokio::test]
    async fn reward_issued_at_threshold(#[case] amount: i64, #[case] issued: bool) {
        let store = Arc::new(InMemoryCouponStore::new());
        let user = Uuid::new_v4();
        let granted = resolver(store.clone())
            .grant_new_coupon_if_eligible(user, amount)
            .await
            .unwrap();

        assert_eq!(granted.is_some(), issued);
        let active = store.find_active_for_owner(user).await.unwrap();
        assert_eq!(active.is_some(), issued);
        if let Some(coupon) = active {
            assert!(coupon.code.starts_with(REWARD_CODE_PREFIX));
            assert_eq!(coupon.code.len(), 10);
            assert_eq!(coupon.discount_percentage, 10);
        }
    }

    #[tokio::test]
    async fn validate_reports_and_deactivates_expired_coupon() {
        let store = Arc::new(InMemoryCouponStore::new());
        let owner = Uuid::new_v4();
        issue(&store, owner, 15, Duration::days(-1)).await;
        let resolver = resolver(store.clone());

        assert!(matches!(
            resolver.validate_coupon("SAVE10", owner).await,
            Err(ServiceError::CouponExpired(_))
        ));
        assert!(!store.all_for_owner(owner)[0].is_active);
        assert!(matches!(
            resolver.validate_coupon("SAVE10", owner).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn validate_returns_discount_for_live_coupon() {
        let store = Arc::new(InMemoryCouponStore::new());
        let owner = Uuid::new_v4();
        issue(&store, owner, 15, Duration::days(3)).await;

        let validation = resolver(store)
            .validate_coupon("SAVE10", owner)
            .await
            .unwrap();
        assert_eq!(
            validation,
            CouponValidation {
                code: "SAVE10".into(),
                discount_percentage: 15,
            }
        );
    }

    #[test]
    fn reward_codes_have_expected_shape() {
        let code = generate_reward_code();
        assert!(code.starts_with("GIFT"));
        assert_eq!(code.len(), 10);
        assert!(code[4..]
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }
}
