//! Domain rules shared by the storefront and admin handlers.

pub mod carts;
pub mod loyalty;
pub mod offers;
pub mod order_status;
pub mod orders;
pub mod pricing;
