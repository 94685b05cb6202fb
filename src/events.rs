//! Event payloads written to the outbox.

use serde::{Deserialize, Serialize};

pub const ORDER_STATUS_CHANGED: &str = "notifications.order_status_changed";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OrderStatusChangedEvent {
    pub order_id: i32,
    pub order_number: String,
    pub user_id: i32,
    pub status: String,
}
