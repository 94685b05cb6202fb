use std::sync::Arc;

use anyhow::{Context, Result};
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl};
use diesel_async::RunQueryDsl;
use futures::future::BoxFuture;
use tracing::info;

use crate::{
    api::notifications::send_message,
    events::OrderStatusChangedEvent,
    platform::app_state::AppState,
    schema::users,
    services::order_status::OrderStatus,
};

pub fn order_status_message(event: &OrderStatusChangedEvent) -> String {
    let label = event
        .status
        .parse::<OrderStatus>()
        .map(|status| status.label())
        .unwrap_or("updated");

    format!("Your order {} is {}.", event.order_number, label)
}

pub fn order_status_changed(
    payload: String,
    state: Arc<AppState>,
) -> BoxFuture<'static, Result<()>> {
    Box::pin(async move {
        let event: OrderStatusChangedEvent = serde_json::from_str(&payload)?;
        info!("Received event: {:?}", event);

        let phone: Option<String> = {
            let conn = &mut state
                .db_pool
                .get()
                .await
                .context("Failed to obtain a DB connection pool")?;

            users::table
                .find(event.user_id)
                .filter(users::deleted_at.is_null())
                .select(users::phone)
                .first::<Option<String>>(conn)
                .await
                .optional()
                .context("Failed to load user phone")?
                .flatten()
        };

        let Some(phone) = phone else {
            info!("User #{} has no phone; skipping notification", event.user_id);
            return Ok(());
        };

        let notifications = &state.config.notifications;
        send_message(
            &state.http_client,
            notifications,
            notifications.channel,
            &phone,
            &order_status_message(&event),
        )
        .await?;

        info!("Order #{} notification sent", event.order_id);
        Ok(())
    })
}
