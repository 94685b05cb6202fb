//! Clients for the third-party services the storefront depends on.

pub mod images;
pub mod notifications;
pub mod payments;
