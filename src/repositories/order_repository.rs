use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction,
    DbErr, EntityTrait, PaginatorTrait, QueryFilter, Set, SqlErr, TransactionTrait,
};
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::entities::order::{
    ActiveModel as OrderActiveModel, Column, Entity as Order, Model as OrderModel,
};
use crate::entities::order_item::ActiveModel as OrderItemActiveModel;
use crate::entities::order_sequence::{self, Entity as OrderSequence};
use crate::errors::ServiceError;
use crate::repositories::{NewOrder, OrderStore, OrderWithItems, Repository, ORDER_SEQUENCE};

use super::BaseRepository;

/// Status recorded on orders created from a confirmed payment.
pub const ORDER_STATUS_PAID: &str = "paid";

/// Repository for order operations
#[derive(Debug, Clone)]
pub struct OrderRepository {
    base: BaseRepository,
}

impl OrderRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            base: BaseRepository::new(db),
        }
    }

    /// Bumps the order counter and reads it back inside `txn`.
    ///
    /// The UPDATE takes the row lock first, so concurrent transactions
    /// serialize on it and never observe the same value.
    async fn next_order_number(txn: &DatabaseTransaction) -> Result<i64, DbErr> {
        OrderSequence::update_many()
            .col_expr(
                order_sequence::Column::Value,
                Expr::col(order_sequence::Column::Value).add(1),
            )
            .filter(order_sequence::Column::Name.eq(ORDER_SEQUENCE))
            .exec(txn)
            .await?;

        OrderSequence::find_by_id(ORDER_SEQUENCE.to_string())
            .one(txn)
            .await?
            .map(|row| row.value)
            .ok_or_else(|| DbErr::RecordNotFound(format!("order sequence '{}'", ORDER_SEQUENCE)))
    }

    async fn insert_order(
        txn: &DatabaseTransaction,
        new_order: NewOrder,
    ) -> Result<OrderWithItems, DbErr> {
        let order_number = Self::next_order_number(txn).await?;
        let order_id = Uuid::new_v4();

        let order = OrderActiveModel {
            id: Set(order_id),
            order_number: Set(order_number),
            user_id: Set(new_order.user_id),
            payment_session_id: Set(new_order.payment_session_id),
            total_amount_cents: Set(new_order.total_amount_cents),
            currency: Set(new_order.currency),
            coupon_code: Set(new_order.coupon_code),
            status: Set(ORDER_STATUS_PAID.to_string()),
            created_at: Set(Utc::now()),
        }
        .insert(txn)
        .await?;

        let mut items = Vec::with_capacity(new_order.items.len());
        for item in new_order.items {
            let saved = OrderItemActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(item.product_id),
                quantity: Set(item.quantity),
                price_at_purchase_cents: Set(item.price_at_purchase_cents),
                name_at_purchase: Set(item.name_at_purchase),
                image_at_purchase: Set(item.image_at_purchase),
            }
            .insert(txn)
            .await?;
            items.push(saved);
        }

        Ok(OrderWithItems { order, items })
    }
}

#[async_trait]
impl OrderStore for OrderRepository {
    #[instrument(skip(self, new_order), fields(payment_session_id = %new_order.payment_session_id))]
    async fn create(&self, new_order: NewOrder) -> Result<OrderWithItems, ServiceError> {
        let session_id = new_order.payment_session_id.clone();
        let txn = self.base.get_db().begin().await?;

        match Self::insert_order(&txn, new_order).await {
            Ok(created) => {
                txn.commit().await?;
                debug!(order_id = %created.order.id, "order persisted");
                Ok(created)
            }
            Err(err) => {
                txn.rollback().await?;
                match err.sql_err() {
                    Some(SqlErr::UniqueConstraintViolation(detail)) => {
                        debug!(%detail, "unique constraint hit while creating order");
                        Err(ServiceError::DuplicatePaymentSession(session_id))
                    }
                    _ => Err(ServiceError::DatabaseError(err)),
                }
            }
        }
    }

    async fn find_by_payment_session(
        &self,
        payment_session_id: &str,
    ) -> Result<Option<OrderModel>, ServiceError> {
        Order::find()
            .filter(Column::PaymentSessionId.eq(payment_session_id))
            .one(self.base.get_db())
            .await
            .map_err(ServiceError::DatabaseError)
    }

    async fn count_for_payment_session(
        &self,
        payment_session_id: &str,
    ) -> Result<u64, ServiceError> {
        Order::find()
            .filter(Column::PaymentSessionId.eq(payment_session_id))
            .count(self.base.get_db())
            .await
            .map_err(ServiceError::DatabaseError)
    }
}

impl Repository for OrderRepository {
    fn get_db(&self) -> &DatabaseConnection {
        self.base.get_db()
    }
}
