pub mod checkout;
pub mod coupons;

pub use checkout::CheckoutPipeline;
pub use coupons::CouponDiscountResolver;
