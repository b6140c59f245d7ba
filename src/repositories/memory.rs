//! `dashmap`-backed stores for sandbox runs and tests.
//!
//! Each store keeps the atomicity guarantee of its sea-orm counterpart by
//! doing the check-and-write under a single map entry lock.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use uuid::Uuid;

use crate::entities::{CartItemModel, CouponModel, OrderItemModel, OrderModel, ProductModel};
use crate::errors::ServiceError;
use crate::repositories::order_repository::ORDER_STATUS_PAID;
use crate::repositories::{
    CartStore, CouponStore, NewCoupon, NewOrder, OrderStore, OrderWithItems, ProductCatalog,
};

#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    products: DashMap<Uuid, ProductModel>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_products(products: impl IntoIterator<Item = ProductModel>) -> Self {
        let catalog = Self::new();
        for product in products {
            catalog.insert(product);
        }
        catalog
    }

    pub fn insert(&self, product: ProductModel) {
        self.products.insert(product.id, product);
    }

    pub fn remove(&self, id: Uuid) -> Option<ProductModel> {
        self.products.remove(&id).map(|(_, product)| product)
    }
}

#[async_trait]
impl ProductCatalog for InMemoryCatalog {
    async fn find_by_ids(&self, ids: &[Uuid]) -> Result<Vec<ProductModel>, ServiceError> {
        Ok(ids
            .iter()
            .filter_map(|id| self.products.get(id).map(|p| p.value().clone()))
            .collect())
    }
}

/// Coupons keyed by owner.
#[derive(Debug, Default)]
pub struct InMemoryCouponStore {
    by_owner: DashMap<Uuid, Vec<CouponModel>>,
}

impl InMemoryCouponStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every coupon record of the owner, active or not.
    pub fn all_for_owner(&self, owner_id: Uuid) -> Vec<CouponModel> {
        self.by_owner
            .get(&owner_id)
            .map(|coupons| coupons.value().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CouponStore for InMemoryCouponStore {
    async fn find_active(
        &self,
        code: &str,
        owner_id: Uuid,
    ) -> Result<Option<CouponModel>, ServiceError> {
        Ok(self.by_owner.get(&owner_id).and_then(|coupons| {
            coupons
                .iter()
                .find(|c| c.code == code && c.is_active)
                .cloned()
        }))
    }

    async fn find_active_for_owner(
        &self,
        owner_id: Uuid,
    ) -> Result<Option<CouponModel>, ServiceError> {
        Ok(self.by_owner.get(&owner_id).and_then(|coupons| {
            coupons
                .iter()
                .filter(|c| c.is_active)
                .max_by_key(|c| c.created_at)
                .cloned()
        }))
    }

    async fn replace_for_owner(&self, coupon: NewCoupon) -> Result<CouponModel, ServiceError> {
        let created = CouponModel {
            id: Uuid::new_v4(),
            code: coupon.code,
            owner_id: coupon.owner_id,
            discount_percentage: coupon.discount_percentage,
            expires_at: coupon.expires_at,
            is_active: true,
            created_at: Utc::now(),
        };
        self.by_owner.insert(coupon.owner_id, vec![created.clone()]);
        Ok(created)
    }

    async fn deactivate(&self, code: &str, owner_id: Uuid) -> Result<bool, ServiceError> {
        let Some(mut coupons) = self.by_owner.get_mut(&owner_id) else {
            return Ok(false);
        };

        let mut found = false;
        for coupon in coupons.iter_mut().filter(|c| c.code == code && c.is_active) {
            coupon.is_active = false;
            found = true;
        }
        Ok(found)
    }
}

#[derive(Debug, Clone)]
struct CartEntry {
    cart_id: Uuid,
    items: Vec<CartItemModel>,
}

#[derive(Debug, Default)]
pub struct InMemoryCartStore {
    carts: DashMap<Uuid, CartEntry>,
}

impl InMemoryCartStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CartStore for InMemoryCartStore {
    async fn items(&self, user_id: Uuid) -> Result<Vec<CartItemModel>, ServiceError> {
        Ok(self
            .carts
            .get(&user_id)
            .map(|cart| cart.items.clone())
            .unwrap_or_default())
    }

    async fn add_item(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<CartItemModel, ServiceError> {
        let mut cart = self.carts.entry(user_id).or_insert_with(|| CartEntry {
            cart_id: Uuid::new_v4(),
            items: Vec::new(),
        });

        let item = CartItemModel {
            id: Uuid::new_v4(),
            cart_id: cart.cart_id,
            product_id,
            quantity,
            created_at: Utc::now(),
        };
        cart.items.push(item.clone());
        Ok(item)
    }

    async fn clear(&self, user_id: Uuid) -> Result<(), ServiceError> {
        if let Some(mut cart) = self.carts.get_mut(&user_id) {
            cart.items.clear();
        }
        Ok(())
    }
}

/// Orders keyed by payment session id.
///
/// The map entry for a session id is the uniqueness constraint: the vacant
/// check, number allocation and insert all happen under its lock.
#[derive(Debug, Default)]
pub struct InMemoryOrderStore {
    by_session: DashMap<String, OrderWithItems>,
    sequence: AtomicI64,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_session.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_session.is_empty()
    }

    pub fn get(&self, payment_session_id: &str) -> Option<OrderWithItems> {
        self.by_session
            .get(payment_session_id)
            .map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn create(&self, new_order: NewOrder) -> Result<OrderWithItems, ServiceError> {
        match self.by_session.entry(new_order.payment_session_id.clone()) {
            Entry::Occupied(_) => Err(ServiceError::DuplicatePaymentSession(
                new_order.payment_session_id,
            )),
            Entry::Vacant(slot) => {
                let order_id = Uuid::new_v4();
                let order = OrderModel {
                    id: order_id,
                    order_number: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
                    user_id: new_order.user_id,
                    payment_session_id: new_order.payment_session_id,
                    total_amount_cents: new_order.total_amount_cents,
                    currency: new_order.currency,
                    coupon_code: new_order.coupon_code,
                    status: ORDER_STATUS_PAID.to_string(),
                    created_at: Utc::now(),
                };
                let items = new_order
                    .items
                    .into_iter()
                    .map(|item| OrderItemModel {
                        id: Uuid::new_v4(),
                        order_id,
                        product_id: item.product_id,
                        quantity: item.quantity,
                        price_at_purchase_cents: item.price_at_purchase_cents,
                        name_at_purchase: item.name_at_purchase,
                        image_at_purchase: item.image_at_purchase,
                    })
                    .collect();

                let created = OrderWithItems { order, items };
                slot.insert(created.clone());
                Ok(created)
            }
        }
    }

    async fn find_by_payment_session(
        &self,
        payment_session_id: &str,
    ) -> Result<Option<OrderModel>, ServiceError> {
        Ok(self
            .by_session
            .get(payment_session_id)
            .map(|entry| entry.order.clone()))
    }

    async fn count_for_payment_session(
        &self,
        payment_session_id: &str,
    ) -> Result<u64, ServiceError> {
        Ok(u64::from(self.by_session.contains_key(payment_session_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::NewOrderItem;
    use chrono::Duration;
    use std::sync::Arc;

    fn new_order(session: &str) -> NewOrder {
        NewOrder {
            user_id: Uuid::new_v4(),
            payment_session_id: session.to_string(),
            total_amount_cents: 9000,
            currency: "usd".into(),
            coupon_code: None,
            items: vec![NewOrderItem {
                product_id: Uuid::new_v4(),
                quantity: 2,
                price_at_purchase_cents: 5000,
                name_at_purchase: "Desk Lamp".into(),
                image_at_purchase: None,
            }],
        }
    }

    #[tokio::test]
    async fn order_store_rejects_second_order_for_session() {
        let store = InMemoryOrderStore::new();
        let first = store.create(new_order("cs_1")).await.unwrap();
        assert_eq!(first.order.order_number, 1);
        assert_eq!(first.items.len(), 1);

        let err = store.create(new_order("cs_1")).await.unwrap_err();
        assert!(matches!(err, ServiceError::DuplicatePaymentSession(id) if id == "cs_1"));
        assert_eq!(store.count_for_payment_session("cs_1").await.unwrap(), 1);

        let second = store.create(new_order("cs_2")).await.unwrap();
        assert_eq!(second.order.order_number, 2);
    }

    #[tokio::test]
    async fn order_store_admits_one_winner_under_contention() {
        let store = Arc::new(InMemoryOrderStore::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.create(new_order("cs_race")).await })
            })
            .collect();

        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn coupon_replace_leaves_single_active_coupon() {
        let store = InMemoryCouponStore::new();
        let owner = Uuid::new_v4();
        let expires_at = Utc::now() + Duration::days(30);

        for code in ["GIFTAAAAAA", "GIFTBBBBBB"] {
            store
                .replace_for_owner(NewCoupon {
                    code: code.into(),
                    owner_id: owner,
                    discount_percentage: 10,
                    expires_at,
                })
                .await
                .unwrap();
        }

        let all = store.all_for_owner(owner);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].code, "GIFTBBBBBB");
        assert!(store.find_active("GIFTAAAAAA", owner).await.unwrap().is_none());

        assert!(store.deactivate("GIFTBBBBBB", owner).await.unwrap());
        assert!(!store.deactivate("GIFTBBBBBB", owner).await.unwrap());
        assert!(store.find_active_for_owner(owner).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cart_clear_empties_without_removing_cart() {
        let store = InMemoryCartStore::new();
        let user = Uuid::new_v4();
        let first = store.add_item(user, Uuid::new_v4(), 1).await.unwrap();
        let second = store.add_item(user, Uuid::new_v4(), 3).await.unwrap();
        assert_eq!(first.cart_id, second.cart_id);
        assert_eq!(store.items(user).await.unwrap().len(), 2);

        store.clear(user).await.unwrap();
        assert!(store.items(user).await.unwrap().is_empty());

        let after = store.add_item(user, Uuid::new_v4(), 1).await.unwrap();
        assert_eq!(after.cart_id, first.cart_id);
    }
}
