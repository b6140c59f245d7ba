//! Integer minor-unit (cent) arithmetic.
//!
//! Monetary values cross the payment provider boundary and flow through all
//! arithmetic as `i64` cents. [`Decimal`] major units appear only at the
//! request/response edges.
//!
//! Rounding is half-up (`MidpointAwayFromZero`; all accepted amounts are
//! non-negative), which is the mode the card processor applies to percentage
//! coupons.

use crate::errors::ServiceError;
use rust_decimal::{prelude::ToPrimitive, Decimal, RoundingStrategy};

/// Number of minor units in one major unit.
pub const MINOR_UNITS_PER_MAJOR: i64 = 100;

const ROUNDING: RoundingStrategy = RoundingStrategy::MidpointAwayFromZero;

/// Converts a decimal major-unit amount into whole cents, rounding half-up.
pub fn to_minor_units(amount: Decimal) -> Result<i64, ServiceError> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(ServiceError::InvalidInput(format!(
            "amount must not be negative: {}",
            amount
        )));
    }

    amount
        .checked_mul(Decimal::from(MINOR_UNITS_PER_MAJOR))
        .map(|cents| cents.round_dp_with_strategy(0, ROUNDING))
        .and_then(|cents| cents.to_i64())
        .ok_or_else(|| ServiceError::InvalidInput(format!("amount out of range: {}", amount)))
}

/// Converts cents into a decimal major-unit amount. Exact.
pub fn to_major_units(cents: i64) -> Result<Decimal, ServiceError> {
    if cents < 0 {
        return Err(ServiceError::InvalidInput(format!(
            "amount must not be negative: {} cents",
            cents
        )));
    }
    Ok(Decimal::new(cents, 2))
}

/// `round(cents * percentage / 100)`, rounding half-up.
///
/// `percentage` is clamped into `0..=100` so the result never exceeds `cents`.
pub fn percentage_of(cents: i64, percentage: i32) -> i64 {
    let percentage = percentage.clamp(0, 100);
    let share = Decimal::from(cents) * Decimal::from(percentage) / Decimal::from(100);
    share
        .round_dp_with_strategy(0, ROUNDING)
        .to_i64()
        .unwrap_or(cents)
}

/// Multiplies a unit price by a quantity, refusing to overflow.
pub fn line_total(unit_amount_cents: i64, quantity: i64) -> Result<i64, ServiceError> {
    unit_amount_cents.checked_mul(quantity).ok_or_else(|| {
        ServiceError::InvalidInput(format!(
            "line total overflows: {} x {}",
            unit_amount_cents, quantity
        ))
    })
}
