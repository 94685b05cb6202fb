//! Transactional outbox.
//!
//! Events are written with [`publish`] inside the same transaction as the
//! state change that caused them. [`run_dispatcher`] drains pending rows and
//! hands each to the handler registered for its event type.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use diesel::{ExpressionMethods, QueryDsl, SelectableHelper};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::time::MissedTickBehavior;

use crate::{
    models::{CreateOutboxEntity, OutboxEntity},
    platform::app_state::AppState,
    schema::outbox,
};

pub const STATUS_PENDING: &str = "PENDING";
pub const STATUS_SENT: &str = "SENT";
pub const STATUS_FAILED: &str = "FAILED";
pub const STATUS_UNHANDLED: &str = "UNHANDLED";

const BATCH_SIZE: i64 = 50;

pub type OutboxHandler = fn(String, Arc<AppState>) -> BoxFuture<'static, Result<()>>;

pub async fn publish<T: Serialize>(
    conn: &mut AsyncPgConnection,
    event_type: String,
    payload: T,
) -> Result<()> {
    let payload = serde_json::to_string(&payload).context("Failed to serialize outbox payload")?;

    diesel::insert_into(outbox::table)
        .values(CreateOutboxEntity {
            event_type,
            payload,
        })
        .execute(conn)
        .await
        .context("Failed to insert outbox event")?;

    Ok(())
}

/// Polls the outbox forever. Each row is attempted once and left SENT, FAILED or UNHANDLED.
pub async fn run_dispatcher(
    state: Arc<AppState>,
    handlers: &'static [(&'static str, OutboxHandler)],
    poll_interval: Duration,
) {
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        if let Err(err) = dispatch_batch(&state, handlers).await {
            tracing::error!("Outbox dispatch failed: {:?}", err);
        }
    }
}

async fn dispatch_batch(
    state: &Arc<AppState>,
    handlers: &[(&'static str, OutboxHandler)],
) -> Result<()> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let events: Vec<OutboxEntity> = outbox::table
        .filter(outbox::status.eq(STATUS_PENDING))
        .order_by(outbox::id.asc())
        .limit(BATCH_SIZE)
        .select(OutboxEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to get pending outbox events")?;

    for event in events {
        let status = match handler_for(handlers, &event.event_type) {
            Some(handler) => match handler(event.payload, state.clone()).await {
                Ok(()) => STATUS_SENT,
                Err(err) => {
                    tracing::warn!("Outbox event #{} ({}) failed: {:?}", event.id, event.event_type, err);
                    STATUS_FAILED
                }
            },
            None => {
                tracing::warn!("No handler for outbox event type {}", event.event_type);
                STATUS_UNHANDLED
            }
        };

        diesel::update(outbox::table.find(event.id))
            .set((
                outbox::status.eq(status),
                outbox::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)
            .await
            .context("Failed to update outbox event")?;
    }

    Ok(())
}

fn handler_for(
    handlers: &[(&'static str, OutboxHandler)],
    event_type: &str,
) -> Option<OutboxHandler> {
    handlers
        .iter()
        .find(|(name, _)| *name == event_type)
        .map(|(_, handler)| *handler)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: String, _: Arc<AppState>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    #[test]
    fn finds_registered_handler() {
        let handlers: &[(&'static str, OutboxHandler)] = &[("notifications.order_status", noop)];
        assert!(handler_for(handlers, "notifications.order_status").is_some());
        assert!(handler_for(handlers, "notifications.unknown").is_none());
    }
}
