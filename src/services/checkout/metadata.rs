//! Wire format of the metadata bag stored with a payment session.
//!
//! Providers only keep string values of bounded length, so the product
//! snapshot travels as a JSON array split across `products`, `products_1`,
//! `products_2` and so on.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::errors::ServiceError;

pub const USER_ID_KEY: &str = "userId";
pub const COUPON_CODE_KEY: &str = "couponCode";
pub const PRODUCTS_KEY: &str = "products";

/// Longest value a provider accepts for one metadata key.
pub const MAX_VALUE_LEN: usize = 500;
/// Keys a provider accepts in one metadata bag.
pub const MAX_KEYS: usize = 50;

fn products_key(chunk: usize) -> String {
    if chunk == 0 {
        PRODUCTS_KEY.to_string()
    } else {
        format!("{}_{}", PRODUCTS_KEY, chunk)
    }
}

/// Splits `value` into pieces of at most `max` bytes on char boundaries.
fn split_value(value: &str, max: usize) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut rest = value;
    while rest.len() > max {
        let mut cut = max;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == 0 {
            cut = rest
                .char_indices()
                .nth(1)
                .map_or(rest.len(), |(index, _)| index);
        }
        let (head, tail) = rest.split_at(cut);
        parts.push(head);
        rest = tail;
    }
    parts.push(rest);
    parts
}

/// One requested product, as the client submitted it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotProduct {
    pub id: Uuid,
    pub quantity: i32,
    pub price: Decimal,
}

/// Everything the finalizer needs to rebuild the order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutMetadata {
    pub user_id: Uuid,
    pub coupon_code: Option<String>,
    pub products: Vec<SnapshotProduct>,
}

impl CheckoutMetadata {
    /// Fails with [`ServiceError::InvalidInput`] when the snapshot needs more
    /// keys than a provider keeps.
    pub fn to_metadata(&self) -> Result<HashMap<String, String>, ServiceError> {
        let products = serde_json::to_string(&self.products)?;
        let chunks = split_value(&products, MAX_VALUE_LEN);
        if chunks.len() + 2 > MAX_KEYS {
            return Err(ServiceError::InvalidInput(format!(
                "too many products for one checkout ({})",
                self.products.len()
            )));
        }

        let mut metadata = HashMap::from([
            (USER_ID_KEY.to_string(), self.user_id.to_string()),
            (
                COUPON_CODE_KEY.to_string(),
                self.coupon_code.clone().unwrap_or_default(),
            ),
        ]);
        for (index, chunk) in chunks.into_iter().enumerate() {
            metadata.insert(products_key(index), chunk.to_string());
        }
        Ok(metadata)
    }

    /// Parses the bag written by [`to_metadata`](Self::to_metadata).
    ///
    /// Any deviation is reported as [`ServiceError::CorruptedMetadata`].
    pub fn from_metadata(metadata: &HashMap<String, String>) -> Result<Self, ServiceError> {
        let field = |key: &str| {
            metadata
                .get(key)
                .ok_or_else(|| ServiceError::CorruptedMetadata(format!("missing '{}'", key)))
        };

        let user_id = Uuid::parse_str(field(USER_ID_KEY)?).map_err(|e| {
            ServiceError::CorruptedMetadata(format!("'{}' is not a uuid: {}", USER_ID_KEY, e))
        })?;

        let coupon_code = metadata
            .get(COUPON_CODE_KEY)
            .map(|code| code.trim())
            .filter(|code| !code.is_empty())
            .map(str::to_string);

        let mut joined = field(PRODUCTS_KEY)?.clone();
        for chunk in 1..MAX_KEYS {
            match metadata.get(&products_key(chunk)) {
                Some(part) => joined.push_str(part),
                None => break,
            }
        }

        let products: Vec<SnapshotProduct> = serde_json::from_str(&joined)
            .map_err(|e| {
                ServiceError::CorruptedMetadata(format!("'{}' is malformed: {}", PRODUCTS_KEY, e))
            })?;

        if products.is_empty() {
            return Err(ServiceError::CorruptedMetadata(format!(
                "'{}' is empty",
                PRODUCTS_KEY
            )));
        }
        if let Some(bad) = products
            .iter()
            .find(|p| p.quantity <= 0 || p.price.is_sign_negative())
        {
            return Err(ServiceError::CorruptedMetadata(format!(
                "invalid snapshot entry for product {}",
                bad.id
            )));
        }

        Ok(Self {
            user_id,
            coupon_code,
            products,
        })
    }
}
