use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QueryOrder, Set, SqlErr, TransactionTrait,
};
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::entities::coupon::{
    ActiveModel as CouponActiveModel, Column, Entity as Coupon, Model as CouponModel,
};
use crate::errors::ServiceError;
use crate::repositories::{CouponStore, NewCoupon, Repository};

use super::BaseRepository;

/// Repository for per-user coupons
#[derive(Debug, Clone)]
pub struct CouponRepository {
    base: BaseRepository,
}

/// Attempts at replacing an owner's coupon before giving up on a race.
const REPLACE_ATTEMPTS: usize = 3;

impl CouponRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            base: BaseRepository::new(db),
        }
    }

    /// Deletes every coupon of the owner and inserts `coupon` in one transaction.
    ///
    /// `idx_coupons_owner` allows one row per owner, so a concurrent replace
    /// that slipped past the delete fails on insert instead of adding a second row.
    async fn try_replace(&self, coupon: &NewCoupon) -> Result<(CouponModel, u64), DbErr> {
        let txn = self.base.get_db().begin().await?;

        let removed = Coupon::delete_many()
            .filter(Column::OwnerId.eq(coupon.owner_id))
            .exec(&txn)
            .await?;

        let inserted = CouponActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(coupon.code.clone()),
            owner_id: Set(coupon.owner_id),
            discount_percentage: Set(coupon.discount_percentage),
            expires_at: Set(coupon.expires_at),
            is_active: Set(true),
            created_at: Set(Utc::now()),
        }
        .insert(&txn)
        .await;

        match inserted {
            Ok(created) => {
                txn.commit().await?;
                Ok((created, removed.rows_affected))
            }
            Err(err) => {
                txn.rollback().await?;
                Err(err)
            }
        }
    }
}

#[async_trait]
impl CouponStore for CouponRepository {
    async fn find_active(
        &self,
        code: &str,
        owner_id: Uuid,
    ) -> Result<Option<CouponModel>, ServiceError> {
        Coupon::find()
            .filter(Column::Code.eq(code))
            .filter(Column::OwnerId.eq(owner_id))
            .filter(Column::IsActive.eq(true))
            .one(self.base.get_db())
            .await
            .map_err(ServiceError::DatabaseError)
    }

    async fn find_active_for_owner(
        &self,
        owner_id: Uuid,
    ) -> Result<Option<CouponModel>, ServiceError> {
        Coupon::find()
            .filter(Column::OwnerId.eq(owner_id))
            .filter(Column::IsActive.eq(true))
            .order_by_desc(Column::CreatedAt)
            .one(self.base.get_db())
            .await
            .map_err(ServiceError::DatabaseError)
    }

    #[instrument(skip(self, coupon), fields(owner_id = %coupon.owner_id))]
    async fn replace_for_owner(&self, coupon: NewCoupon) -> Result<CouponModel, ServiceError> {
        let mut attempt = 1;
        loop {
            match self.try_replace(&coupon).await {
                Ok((created, removed)) => {
                    debug!(replaced = removed, "coupon issued");
                    return Ok(created);
                }
                Err(err) => match err.sql_err() {
                    Some(SqlErr::UniqueConstraintViolation(detail))
                        if attempt < REPLACE_ATTEMPTS =>
                    {
                        warn!(%detail, attempt, "concurrent coupon replace, retrying");
                        attempt += 1;
                    }
                    _ => return Err(ServiceError::DatabaseError(err)),
                },
            }
        }
    }

    async fn deactivate(&self, code: &str, owner_id: Uuid) -> Result<bool, ServiceError> {
        let result = Coupon::update_many()
            .col_expr(Column::IsActive, Expr::value(false))
            .filter(Column::Code.eq(code))
            .filter(Column::OwnerId.eq(owner_id))
            .filter(Column::IsActive.eq(true))
            .exec(self.base.get_db())
            .await?;

        Ok(result.rows_affected > 0)
    }
}

impl Repository for CouponRepository {
    fn get_db(&self) -> &DatabaseConnection {
        self.base.get_db()
    }
}
