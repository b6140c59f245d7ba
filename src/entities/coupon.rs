use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Percentage coupon owned by a single user.
///
/// At most one active coupon exists per owner; issuance replaces any
/// previous record for that owner.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "coupons")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub code: String,
    pub owner_id: Uuid,
    /// 0..=100
    pub discount_percentage: i32,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Model {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Active and not yet expired.
    pub fn is_redeemable_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && !self.is_expired_at(now)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn coupon(expires_in: Duration, is_active: bool) -> Model {
        let now = Utc::now();
        Model {
            id: Uuid::new_v4(),
            code: "GIFT1A2B3C".into(),
            owner_id: Uuid::new_v4(),
            discount_percentage: 10,
            expires_at: now + expires_in,
            is_active,
            created_at: now,
        }
    }

    #[test]
    fn redeemable_only_when_active_and_unexpired() {
        let now = Utc::now();
        assert!(coupon(Duration::days(1), true).is_redeemable_at(now));
        assert!(!coupon(Duration::days(1), false).is_redeemable_at(now));
        assert!(!coupon(Duration::days(-1), true).is_redeemable_at(now));
    }
}
