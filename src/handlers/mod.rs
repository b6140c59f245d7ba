pub mod coupons;
pub mod payments;
pub mod webhooks;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

pub use coupons::coupon_routes;
pub use payments::payment_routes;
