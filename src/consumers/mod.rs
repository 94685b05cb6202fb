pub mod notifications;

use crate::{events, platform::outbox::OutboxHandler};

/// Outbox event types and the handlers that deliver them.
pub const HANDLERS: &[(&str, OutboxHandler)] = &[(
    events::ORDER_STATUS_CHANGED,
    notifications::order_status_changed,
)];
