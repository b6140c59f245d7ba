use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, SqlErr, TransactionTrait,
};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::entities::cart::{self, Entity as Cart, Model as CartModel};
use crate::entities::cart_item::{self, Entity as CartItem, Model as CartItemModel};
use crate::errors::ServiceError;
use crate::repositories::{CartStore, Repository};

use super::BaseRepository;

/// Repository for user carts and their items
#[derive(Debug, Clone)]
pub struct CartRepository {
    base: BaseRepository,
}

impl CartRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            base: BaseRepository::new(db),
        }
    }

    async fn find_cart<C: ConnectionTrait>(
        conn: &C,
        user_id: Uuid,
    ) -> Result<Option<CartModel>, ServiceError> {
        Cart::find()
            .filter(cart::Column::UserId.eq(user_id))
            .one(conn)
            .await
            .map_err(ServiceError::DatabaseError)
    }

    /// Returns the user's cart, creating it on first use.
    async fn get_or_create_cart(&self, user_id: Uuid) -> Result<CartModel, ServiceError> {
        let db = self.base.get_db();
        if let Some(existing) = Self::find_cart(db, user_id).await? {
            return Ok(existing);
        }

        let now = Utc::now();
        let inserted = cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(db)
        .await;

        match inserted {
            Ok(created) => Ok(created),
            // Another request created it first.
            Err(err) if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                Self::find_cart(db, user_id).await?.ok_or_else(|| {
                    ServiceError::InternalError(format!("cart for user {} vanished", user_id))
                })
            }
            Err(err) => Err(ServiceError::DatabaseError(err)),
        }
    }
}

#[async_trait]
impl CartStore for CartRepository {
    async fn items(&self, user_id: Uuid) -> Result<Vec<CartItemModel>, ServiceError> {
        let db = self.base.get_db();
        let Some(cart) = Self::find_cart(db, user_id).await? else {
            return Ok(Vec::new());
        };

        CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .order_by_asc(cart_item::Column::CreatedAt)
            .all(db)
            .await
            .map_err(ServiceError::DatabaseError)
    }

    #[instrument(skip(self))]
    async fn add_item(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<CartItemModel, ServiceError> {
        let cart = self.get_or_create_cart(user_id).await?;

        cart_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            cart_id: Set(cart.id),
            product_id: Set(product_id),
            quantity: Set(quantity),
            created_at: Set(Utc::now()),
        }
        .insert(self.base.get_db())
        .await
        .map_err(ServiceError::DatabaseError)
    }

    #[instrument(skip(self))]
    async fn clear(&self, user_id: Uuid) -> Result<(), ServiceError> {
        let txn = self.base.get_db().begin().await?;

        if let Some(cart) = Self::find_cart(&txn, user_id).await? {
            CartItem::delete_many()
                .filter(cart_item::Column::CartId.eq(cart.id))
                .exec(&txn)
                .await?;

            let mut touched: cart::ActiveModel = cart.into();
            touched.updated_at = Set(Utc::now());
            touched.update(&txn).await?;
        }

        txn.commit().await?;
        Ok(())
    }
}

impl Repository for CartRepository {
    fn get_db(&self) -> &DatabaseConnection {
        self.base.get_db()
    }
}
