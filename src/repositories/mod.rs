//! Storage seams for the checkout pipeline.
//!
//! Each store is a trait with a sea-orm implementation (the production
//! backend) and an in-memory implementation used by the sandbox profile and
//! by tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use uuid::Uuid;

use crate::entities::{CartItemModel, CouponModel, OrderItemModel, OrderModel, ProductModel};
use crate::errors::ServiceError;

pub mod cart_repository;
pub mod catalog_repository;
pub mod coupon_repository;
pub mod memory;
pub mod order_repository;

pub use cart_repository::CartRepository;
pub use catalog_repository::CatalogRepository;
pub use coupon_repository::CouponRepository;
pub use memory::{InMemoryCartStore, InMemoryCatalog, InMemoryCouponStore, InMemoryOrderStore};
pub use order_repository::OrderRepository;

/// Name of the counter row that numbers orders.
pub const ORDER_SEQUENCE: &str = "orders";

/// Repository trait for common database operations
pub trait Repository {
    fn get_db(&self) -> &DatabaseConnection;
}

#[derive(Debug, Clone)]
pub struct BaseRepository {
    db: Arc<DatabaseConnection>,
}

impl BaseRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

impl Repository for BaseRepository {
    fn get_db(&self) -> &DatabaseConnection {
        &self.db
    }
}

/// Read-only product lookup.
#[async_trait]
pub trait ProductCatalog: Send + Sync {
    /// Returns the products that exist among `ids`; unknown ids are omitted.
    async fn find_by_ids(&self, ids: &[Uuid]) -> Result<Vec<ProductModel>, ServiceError>;
}

/// Input for issuing a coupon.
#[derive(Debug, Clone)]
pub struct NewCoupon {
    pub code: String,
    pub owner_id: Uuid,
    pub discount_percentage: i32,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait CouponStore: Send + Sync {
    /// Active coupon with `code` owned by `owner_id`. Expiry is not checked.
    async fn find_active(
        &self,
        code: &str,
        owner_id: Uuid,
    ) -> Result<Option<CouponModel>, ServiceError>;

    /// The owner's current active coupon, if any.
    async fn find_active_for_owner(
        &self,
        owner_id: Uuid,
    ) -> Result<Option<CouponModel>, ServiceError>;

    /// Atomically removes every coupon of the owner and inserts `coupon`.
    async fn replace_for_owner(&self, coupon: NewCoupon) -> Result<CouponModel, ServiceError>;

    /// Marks the coupon inactive. Returns whether an active coupon was found.
    async fn deactivate(&self, code: &str, owner_id: Uuid) -> Result<bool, ServiceError>;
}

#[async_trait]
pub trait CartStore: Send + Sync {
    async fn items(&self, user_id: Uuid) -> Result<Vec<CartItemModel>, ServiceError>;

    async fn add_item(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<CartItemModel, ServiceError>;

    /// Empties the user's cart. The cart itself is kept.
    async fn clear(&self, user_id: Uuid) -> Result<(), ServiceError>;
}

/// Order line to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrderItem {
    pub product_id: Uuid,
    pub quantity: i32,
    pub price_at_purchase_cents: i64,
    pub name_at_purchase: String,
    pub image_at_purchase: Option<String>,
}

/// Order to persist. The store assigns id and order number.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub user_id: Uuid,
    pub payment_session_id: String,
    pub total_amount_cents: i64,
    pub currency: String,
    pub coupon_code: Option<String>,
    pub items: Vec<NewOrderItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderWithItems {
    pub order: OrderModel,
    pub items: Vec<OrderItemModel>,
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Inserts the order and its items.
    ///
    /// Fails with [`ServiceError::DuplicatePaymentSession`] when an order for
    /// the same payment session already exists.
    async fn create(&self, order: NewOrder) -> Result<OrderWithItems, ServiceError>;

    async fn find_by_payment_session(
        &self,
        payment_session_id: &str,
    ) -> Result<Option<OrderModel>, ServiceError>;

    async fn count_for_payment_session(&self, payment_session_id: &str)
        -> Result<u64, ServiceError>;
}

/// The four stores the pipeline depends on.
#[derive(Clone)]
pub struct Stores {
    pub catalog: Arc<dyn ProductCatalog>,
    pub coupons: Arc<dyn CouponStore>,
    pub carts: Arc<dyn CartStore>,
    pub orders: Arc<dyn OrderStore>,
}

impl Stores {
    pub fn sea_orm(db: Arc<DatabaseConnection>) -> Self {
        Self {
            catalog: Arc::new(CatalogRepository::new(db.clone())),
            coupons: Arc::new(CouponRepository::new(db.clone())),
            carts: Arc::new(CartRepository::new(db.clone())),
            orders: Arc::new(OrderRepository::new(db)),
        }
    }

    pub fn in_memory(catalog: Arc<InMemoryCatalog>) -> Self {
        Self {
            catalog,
            coupons: Arc::new(InMemoryCouponStore::new()),
            carts: Arc::new(InMemoryCartStore::new()),
            orders: Arc::new(InMemoryOrderStore::new()),
        }
    }
}
