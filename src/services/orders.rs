use std::collections::HashMap;

use anyhow::Context;
use chrono::{DateTime, Utc};
use diesel::{ExpressionMethods, QueryDsl, SelectableHelper};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use rand::{Rng, distributions::Alphanumeric};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    events::{self, OrderStatusChangedEvent},
    models::{
        CartItemEntity, CreateOrderItemEntity, MenuItemEntity, OrderEntity, OrderItemEntity,
    },
    platform::{aliases::DieselError, app_error::AppError, outbox},
    schema::{order_items, orders},
    services::{loyalty, offers, order_status::OrderStatus, pricing},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Fulfillment {
    Delivery,
    Pickup,
}

impl Fulfillment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Fulfillment::Delivery => "delivery",
            Fulfillment::Pickup => "pickup",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Cash on delivery, confirmed by an admin.
    Cod,
    Online,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cod => "cod",
            PaymentMethod::Online => "online",
        }
    }
}

pub const PAYMENT_PENDING: &str = "PENDING";
pub const PAYMENT_PAID: &str = "PAID";
pub const PAYMENT_FAILED: &str = "FAILED";

#[derive(Serialize, ToSchema, Debug)]
pub struct OrderWithItems {
    pub order: OrderEntity,
    pub order_items: Vec<OrderItemEntity>,
}

/// `ORD-YYYYMMDD-XXXXXX` with an uppercase alphanumeric suffix.
pub fn generate_order_number(now: DateTime<Utc>) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|c| char::from(c).to_ascii_uppercase())
        .collect();
    format!("ORD-{}-{}", now.format("%Y%m%d"), suffix)
}

pub async fn load_order_items(
    conn: &mut AsyncPgConnection,
    order_ids: &[i32],
) -> Result<HashMap<i32, Vec<OrderItemEntity>>, AppError> {
    let items: Vec<OrderItemEntity> = order_items::table
        .filter(order_items::order_id.eq_any(order_ids))
        .order_by(order_items::id.asc())
        .select(OrderItemEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to get order items")?;

    let mut group: HashMap<i32, Vec<OrderItemEntity>> = HashMap::new();
    for item in items {
        group.entry(item.order_id).or_default().push(item);
    }
    Ok(group)
}

pub async fn with_items(
    conn: &mut AsyncPgConnection,
    orders: Vec<OrderEntity>,
) -> Result<Vec<OrderWithItems>, AppError> {
    let order_ids: Vec<i32> = orders.iter().map(|order| order.id).collect();
    let mut group = load_order_items(conn, &order_ids).await?;

    Ok(orders
        .into_iter()
        .map(|order| OrderWithItems {
            order_items: group.remove(&order.id).unwrap_or_default(),
            order,
        })
        .collect())
}

pub async fn publish_status(conn: &mut AsyncPgConnection, order: &OrderEntity) -> Result<(), AppError> {
    outbox::publish(
        conn,
        events::ORDER_STATUS_CHANGED.into(),
        OrderStatusChangedEvent {
            order_id: order.id,
            order_number: order.order_number.clone(),
            user_id: order.user_id,
            status: order.status.clone(),
        },
    )
    .await?;
    Ok(())
}

/// What moving an order to a new status does besides changing the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Nothing,
    /// Loyalty points earned on delivery.
    Earn(i32),
    /// Cancellation gives back redeemed points and the claimed offer use.
    Release {
        refund_points: i32,
        offer_id: Option<i32>,
    },
}

pub fn settlement_for(order: &OrderEntity, next: OrderStatus, points_per_unit: i32) -> Settlement {
    match next {
        OrderStatus::Delivered => match loyalty::points_earned(order.total, points_per_unit) {
            0 => Settlement::Nothing,
            earned => Settlement::Earn(earned),
        },
        OrderStatus::Cancelled if order.points_redeemed > 0 || order.offer_id.is_some() => {
            Settlement::Release {
                refund_points: order.points_redeemed,
                offer_id: order.offer_id,
            }
        }
        _ => Settlement::Nothing,
    }
}

/// Order lines copied from the cart; later menu edits do not touch them.
pub fn snapshot_lines(
    order_id: i32,
    lines: Vec<(CartItemEntity, MenuItemEntity)>,
) -> Vec<CreateOrderItemEntity> {
    lines
        .into_iter()
        .map(|(item, menu_item)| CreateOrderItemEntity {
            order_id,
            menu_item_id: Some(menu_item.id),
            name: menu_item.name,
            unit_price: item.unit_price,
            quantity: item.quantity,
            instructions: item.instructions,
            line_total: pricing::line_total(item.unit_price, item.quantity),
        })
        .collect()
}

/// Moves an order to `next`, settling loyalty points and offer usage, then queueing a notification.
///
/// Call inside a transaction. The update is conditional on the status read
/// here, so a concurrent change surfaces as 409.
pub async fn change_status(
    conn: &mut AsyncPgConnection,
    order_id: i32,
    next: OrderStatus,
    points_per_unit: i32,
) -> Result<OrderEntity, AppError> {
    let order: OrderEntity = orders::table
        .find(order_id)
        .select(OrderEntity::as_select())
        .get_result(conn)
        .await?;

    let current: OrderStatus = order
        .status
        .parse()
        .map_err(|err: String| AppError::Other(anyhow::anyhow!(err)))?;

    if !current.can_transition_to(next) {
        return Err(AppError::BadRequest(format!(
            "Cannot move order from {current} to {next}"
        )));
    }

    let mut updated: OrderEntity = diesel::update(
        orders::table
            .find(order_id)
            .filter(orders::status.eq(current.as_str())),
    )
    .set((
        orders::status.eq(next.as_str()),
        orders::updated_at.eq(diesel::dsl::now),
    ))
    .returning(OrderEntity::as_returning())
    .get_result(conn)
    .await
    .map_err(|err| match err {
        DieselError::NotFound => AppError::Conflict("Order was updated concurrently".into()),
        err => AppError::Other(err.into()),
    })?;

    match settlement_for(&updated, next, points_per_unit) {
        Settlement::Earn(earned) => {
            loyalty::record_points(
                conn,
                updated.user_id,
                Some(updated.id),
                earned,
                loyalty::REASON_EARNED,
            )
            .await?;

            updated = diesel::update(orders::table.find(order_id))
                .set(orders::points_earned.eq(earned))
                .returning(OrderEntity::as_returning())
                .get_result(conn)
                .await
                .context("Failed to record earned points")?;
        }
        Settlement::Release {
            refund_points,
            offer_id,
        } => {
            if refund_points > 0 {
                loyalty::record_points(
                    conn,
                    updated.user_id,
                    Some(updated.id),
                    refund_points,
                    loyalty::REASON_REFUNDED,
                )
                .await?;
            }
            if let Some(offer_id) = offer_id {
                offers::release_offer(conn, offer_id).await?;
            }
        }
        Settlement::Nothing => {}
    }

    publish_status(conn, &updated).await?;
    tracing::info!("Order #{} moved from {} to {}", order_id, current, next);

    Ok(updated)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    use super::*;
    use crate::services::carts::tests::{cart_item, menu_item};

    fn order(total: Decimal, points_redeemed: i32, offer_id: Option<i32>) -> OrderEntity {
        let now = Utc::now();
        OrderEntity {
            id: 5,
            order_number: "ORD-20250601-ABC123".into(),
            user_id: 9,
            status: OrderStatus::Pending.as_str().into(),
            fulfillment: Fulfillment::Pickup.as_str().into(),
            payment_method: PaymentMethod::Cod.as_str().into(),
            delivery_address: None,
            offer_id,
            subtotal: total,
            offer_discount: Decimal::ZERO,
            loyalty_discount: Decimal::ZERO,
            delivery_fee: Decimal::ZERO,
            total,
            points_redeemed,
            points_earned: 0,
            notes: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn delivery_earns_points_on_the_total() {
        let delivered = order(Decimal::new(45075, 2), 0, None);
        assert_eq!(
            settlement_for(&delivered, OrderStatus::Delivered, 1),
            Settlement::Earn(450)
        );
        assert_eq!(
            settlement_for(&delivered, OrderStatus::Delivered, 2),
            Settlement::Earn(900)
        );
        assert_eq!(
            settlement_for(&order(Decimal::new(50, 2), 0, None), OrderStatus::Delivered, 1),
            Settlement::Nothing
        );
    }

    #[test]
    fn cancellation_releases_points_and_offer() {
        let cancelled = order(Decimal::from(300), 2000, Some(4));
        assert_eq!(
            settlement_for(&cancelled, OrderStatus::Cancelled, 1),
            Settlement::Release {
                refund_points: 2000,
                offer_id: Some(4),
            }
        );
        assert_eq!(
            settlement_for(&order(Decimal::from(300), 0, None), OrderStatus::Cancelled, 1),
            Settlement::Nothing
        );
    }

    #[test]
    fn intermediate_statuses_settle_nothing() {
        let pending = order(Decimal::from(300), 1000, Some(4));
        for next in [
            OrderStatus::Confirmed,
            OrderStatus::Preparing,
            OrderStatus::Ready,
            OrderStatus::OutForDelivery,
        ] {
            assert_eq!(settlement_for(&pending, next, 1), Settlement::Nothing);
        }
    }

    #[test]
    fn snapshots_cart_prices_and_names() {
        let mut line = cart_item(1, 10, 3, Decimal::new(12050, 2));
        line.instructions = Some("No onions".into());
        let items = snapshot_lines(
            42,
            vec![(line, menu_item(10, Decimal::new(12050, 2), true))],
        );
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].order_id, 42);
        assert_eq!(items[0].menu_item_id, Some(10));
        assert_eq!(items[0].name, "Dish 10");
        assert_eq!(items[0].line_total, Decimal::new(36150, 2));
        assert_eq!(items[0].instructions.as_deref(), Some("No onions"));
    }

    #[test]
    fn order_numbers_carry_date_and_suffix() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let number = generate_order_number(now);
        assert!(number.starts_with("ORD-20250601-"));
        let suffix = &number["ORD-20250601-".len()..];
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }
}
