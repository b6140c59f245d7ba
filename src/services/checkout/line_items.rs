use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::money;

/// Provider-agnostic line item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub name: String,
    pub unit_amount_cents: i64,
    pub quantity: i32,
    pub image: Option<String>,
}

/// A requested product already matched against the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCartProduct {
    pub product_id: Uuid,
    pub name: String,
    pub image: Option<String>,
    pub unit_price: Decimal,
    pub quantity: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineItemBatch {
    pub line_items: Vec<LineItem>,
    pub initial_total_cents: i64,
}

/// Quantity actually charged: missing or non-positive means one.
pub fn effective_quantity(quantity: Option<i32>) -> i32 {
    quantity.filter(|q| *q > 0).unwrap_or(1)
}

/// Turns resolved products into line items and their pre-discount total.
pub fn build(products: &[ResolvedCartProduct]) -> Result<LineItemBatch, ServiceError> {
    let mut line_items = Vec::with_capacity(products.len());
    let mut initial_total_cents: i64 = 0;

    for product in products {
        let unit_amount_cents = money::to_minor_units(product.unit_price)?;
        let quantity = effective_quantity(product.quantity);
        let line_total = money::line_total(unit_amount_cents, i64::from(quantity))?;

        initial_total_cents = initial_total_cents.checked_add(line_total).ok_or_else(|| {
            ServiceError::InvalidInput("checkout total is out of range".to_string())
        })?;

        line_items.push(LineItem {
            name: product.name.clone(),
            unit_amount_cents,
            quantity,
            image: product.image.clone(),
        });
    }

    Ok(LineItemBatch {
        line_items,
        initial_total_cents,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn product(price: Decimal, quantity: Option<i32>) -> ResolvedCartProduct {
        ResolvedCartProduct {
            product_id: Uuid::new_v4(),
            name: "Notebook".into(),
            image: Some("notebook.png".into()),
            unit_price: price,
            quantity,
        }
    }

    #[test]
    fn sums_lines_in_cents() {
        let batch = build(&[
            product(dec!(19.99), Some(3)),
            product(dec!(0.10), Some(1)),
            product(dec!(0.20), Some(1)),
        ])
        .unwrap();

        assert_eq!(batch.initial_total_cents, 5997 + 10 + 20);
        assert_eq!(batch.line_items[0].unit_amount_cents, 1999);
        assert_eq!(batch.line_items[0].quantity, 3);
        assert_eq!(batch.line_items[0].image.as_deref(), Some("notebook.png"));
    }

    #[test]
    fn missing_or_non_positive_quantity_counts_as_one() {
        let batch = build(&[
            product(dec!(5), None),
            product(dec!(5), Some(0)),
            product(dec!(5), Some(-4)),
        ])
        .unwrap();
        assert!(batch.line_items.iter().all(|item| item.quantity == 1));
        assert_eq!(batch.initial_total_cents, 1500);
    }

    #[test]
    fn negative_price_is_rejected() {
        assert!(matches!(
            build(&[product(dec!(-1), Some(1))]),
            Err(ServiceError::InvalidInput(_))
        ));
    }

    #[test]
    fn empty_input_builds_empty_batch() {
        let batch = build(&[]).unwrap();
        assert!(batch.line_items.is_empty());
        assert_eq!(batch.initial_total_cents, 0);
    }
}
