use anyhow::Context;
use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use chrono::Utc;
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;
use validator::Validate;

use crate::{
    api::payments::{self as payment_gateway},
    models::{
        AddressEntity, CartEntity, CreateOrderEntity, CreatePaymentEntity,
        OfferEntity, OrderEntity, OrderItemEntity, PaymentEntity,
    },
    platform::{
        app_error::{AppError, StdResponse},
        app_state::AppState,
        middleware::{self, AuthUser, Viewer},
        pagination::{PageParams, Paginated},
    },
    schema::{addresses, carts, cart_items, offers, order_items, orders, payments, users},
    services::{
        carts::{cart_lines, refresh_prices, repriced_lines, unavailable_items},
        loyalty,
        offers::{self as offer_rules, audience_profile, find_by_code},
        order_status::OrderStatus,
        orders::{
            Fulfillment, OrderWithItems, PAYMENT_PAID, PAYMENT_PENDING, PaymentMethod,
            change_status, generate_order_number, load_order_items, publish_status, snapshot_lines,
            with_items,
        },
        pricing,
    },
};

pub fn routes_with_openapi(state: &AppState) -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/customers/orders",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(list_my_orders))
            .routes(utoipa_axum::routes!(place_order))
            .routes(utoipa_axum::routes!(get_my_order))
            .routes(utoipa_axum::routes!(cancel_my_order))
            .routes(utoipa_axum::routes!(create_payment))
            .route_layer(axum::middleware::from_fn_with_state(
                state.clone(),
                middleware::customers_authorization,
            )),
    )
}

/// Fetch the authenticated customer's orders, newest first.
#[utoipa::path(
    get,
    path = "/",
    tags = ["Orders"],
    security(("bearerAuth" = [])),
    params(PageParams),
    responses(
        (status = 200, description = "Get orders successfully", body = StdResponse<Paginated<OrderWithItems>, String>)
    )
)]
async fn list_my_orders(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(page): Query<PageParams>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let total: i64 = orders::table
        .filter(orders::user_id.eq(user.id))
        .count()
        .get_result(conn)
        .await
        .context("Failed to count orders")?;

    let my_orders: Vec<OrderEntity> = orders::table
        .filter(orders::user_id.eq(user.id))
        .order_by(orders::created_at.desc())
        .limit(page.per_page())
        .offset(page.offset())
        .select(OrderEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to get orders")?;

    let items = with_items(conn, my_orders).await?;

    Ok(StdResponse {
        data: Some(Paginated::new(items, page, total)),
        message: Some("Get orders successfully"),
    })
}

/// Fetch one of the authenticated customer's orders.
#[utoipa::path(
    get,
    path = "/{id}",
    tags = ["Orders"],
    security(("bearerAuth" = [])),
    params(
        ("id" = i32, Path, description = "Order ID")
    ),
    responses(
        (status = 200, description = "Get order successfully", body = StdResponse<OrderWithItems, String>),
        (status = 404, description = "Order not found")
    )
)]
async fn get_my_order(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let order = owned_order(conn, id, user.id).await?;
    let order_items: Vec<OrderItemEntity> = load_order_items(conn, &[order.id])
        .await?
        .remove(&order.id)
        .unwrap_or_default();

    Ok(StdResponse {
        data: Some(OrderWithItems { order, order_items }),
        message: Some("Get order successfully"),
    })
}

async fn owned_order(
    conn: &mut AsyncPgConnection,
    id: i32,
    user_id: i32,
) -> Result<OrderEntity, AppError> {
    let order = orders::table
        .find(id)
        .filter(orders::user_id.eq(user_id))
        .select(OrderEntity::as_select())
        .get_result(conn)
        .await?;
    Ok(order)
}

#[derive(Deserialize, Validate, ToSchema, Debug)]
pub struct PlaceOrderReq {
    pub fulfillment: Fulfillment,
    pub payment_method: PaymentMethod,
    /// Required for deliveries.
    pub address_id: Option<i32>,
    pub offer_id: Option<i32>,
    #[validate(length(min = 1, max = 32))]
    pub coupon_code: Option<String>,
    #[serde(default)]
    pub redeem_points: bool,
    #[validate(length(max = 500))]
    pub notes: Option<String>,
}

#[derive(Serialize, Debug)]
struct AddressSnapshot<'a> {
    label: &'a str,
    line1: &'a str,
    line2: Option<&'a str>,
    city: &'a str,
    postal_code: &'a str,
    landmark: Option<&'a str>,
}

fn address_snapshot(address: &AddressEntity) -> Result<serde_json::Value, AppError> {
    let snapshot = serde_json::to_value(AddressSnapshot {
        label: &address.label,
        line1: &address.line1,
        line2: address.line2.as_deref(),
        city: &address.city,
        postal_code: &address.postal_code,
        landmark: address.landmark.as_deref(),
    })
    .context("Failed to snapshot delivery address")?;
    Ok(snapshot)
}

async fn resolve_offer(
    conn: &mut AsyncPgConnection,
    offer_id: Option<i32>,
    coupon_code: Option<&str>,
) -> Result<Option<OfferEntity>, AppError> {
    match (offer_id, coupon_code) {
        (Some(_), Some(_)) => Err(AppError::BadRequest(
            "Apply either an offer or a coupon code, not both".into(),
        )),
        (Some(id), None) => offers::table
            .find(id)
            .select(OfferEntity::as_select())
            .get_result(conn)
            .await
            .optional()
            .context("Failed to get offer")?
            .map(Some)
            .ok_or_else(|| AppError::BadRequest("Offer does not exist".into())),
        (None, Some(code)) => find_by_code(conn, code)
            .await?
            .map(Some)
            .ok_or_else(|| AppError::BadRequest("Coupon code is not valid".into())),
        (None, None) => Ok(None),
    }
}

/// Turn the customer's cart into an order.
#[utoipa::path(
    post,
    path = "/",
    tags = ["Orders"],
    security(("bearerAuth" = [])),
    request_body = PlaceOrderReq,
    responses(
        (status = 200, description = "Placed order successfully", body = StdResponse<OrderWithItems, String>),
        (status = 400, description = "Empty cart, unavailable items, changed prices or an unusable offer"),
        (status = 404, description = "Delivery address not found")
    )
)]
async fn place_order(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<PlaceOrderReq>,
) -> Result<impl IntoResponse, AppError> {
    body.validate()?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    // Stale prices are refreshed outside the order transaction so the next attempt succeeds.
    let cart: Option<CartEntity> = carts::table
        .filter(carts::user_id.eq(user.id))
        .select(CartEntity::as_select())
        .first(conn)
        .await
        .optional()
        .context("Failed to get cart")?;
    if let Some(cart) = &cart {
        let repriced = repriced_lines(&cart_lines(conn, cart.id).await?);
        if !repriced.is_empty() {
            refresh_prices(conn, &repriced).await?;
            let names: Vec<&str> = repriced.iter().map(|(_, _, name)| name.as_str()).collect();
            return Err(AppError::BadRequest(format!(
                "Prices changed for: {}. Please review your cart",
                names.join(", ")
            )));
        }
    }

    let config = state.config.clone();

    let placed = conn
        .transaction(move |conn| {
            Box::pin(async move {
                let cart = cart.ok_or_else(|| AppError::BadRequest("Your cart is empty".into()))?;
                let lines = cart_lines(conn, cart.id).await?;
                if lines.is_empty() {
                    return Err(AppError::BadRequest("Your cart is empty".into()));
                }

                let unavailable = unavailable_items(&lines);
                if !unavailable.is_empty() {
                    return Err(AppError::BadRequest(format!(
                        "No longer available: {}",
                        unavailable.join(", ")
                    )));
                }
                if !repriced_lines(&lines).is_empty() {
                    return Err(AppError::Conflict(
                        "Menu prices changed while placing the order".into(),
                    ));
                }

                let delivery_address = match body.fulfillment {
                    Fulfillment::Delivery => {
                        let address_id = body.address_id.ok_or_else(|| {
                            AppError::BadRequest("A delivery address is required".into())
                        })?;
                        let address: AddressEntity = addresses::table
                            .find(address_id)
                            .filter(addresses::user_id.eq(user.id))
                            .select(AddressEntity::as_select())
                            .get_result(conn)
                            .await?;
                        Some(address_snapshot(&address)?)
                    }
                    Fulfillment::Pickup => None,
                };

                let subtotal = pricing::subtotal(
                    lines
                        .iter()
                        .map(|(item, _)| (item.unit_price, item.quantity)),
                );

                let offer = resolve_offer(conn, body.offer_id, body.coupon_code.as_deref()).await?;
                let offer_discount = match &offer {
                    Some(offer) => {
                        let viewer = Viewer::User(user.clone());
                        let profile = audience_profile(conn, Some(&viewer)).await?;
                        if !offer_rules::is_visible_to(offer, &profile, Utc::now()) {
                            return Err(AppError::BadRequest(
                                "This offer is not available to you".into(),
                            ));
                        }
                        let discount = offer_rules::discount_for(offer, subtotal)?;

                        offer_rules::claim_offer(conn, offer.id).await?;
                        discount
                    }
                    None => Decimal::ZERO,
                };

                let redeemable_points = if body.redeem_points {
                    let points: i32 = users::table
                        .find(user.id)
                        .select(users::loyalty_points)
                        .get_result(conn)
                        .await?;
                    Some(points)
                } else {
                    None
                };

                let delivery_fee = match body.fulfillment {
                    Fulfillment::Delivery => config.ordering.delivery_fee,
                    Fulfillment::Pickup => Decimal::ZERO,
                };

                let totals =
                    pricing::order_totals(subtotal, offer_discount, redeemable_points, delivery_fee);

                let order: OrderEntity = diesel::insert_into(orders::table)
                    .values(CreateOrderEntity {
                        order_number: generate_order_number(Utc::now()),
                        user_id: user.id,
                        status: OrderStatus::Pending.as_str().into(),
                        fulfillment: body.fulfillment.as_str().into(),
                        payment_method: body.payment_method.as_str().into(),
                        delivery_address,
                        offer_id: offer.as_ref().map(|offer| offer.id),
                        subtotal: totals.subtotal,
                        offer_discount: totals.offer_discount,
                        loyalty_discount: totals.loyalty_discount,
                        delivery_fee: totals.delivery_fee,
                        total: totals.total,
                        points_redeemed: totals.points_redeemed,
                        notes: body.notes,
                    })
                    .returning(OrderEntity::as_returning())
                    .get_result(conn)
                    .await
                    .context("Failed to create order")?;

                let new_items = snapshot_lines(order.id, lines);

                let order_items: Vec<OrderItemEntity> = diesel::insert_into(order_items::table)
                    .values(&new_items)
                    .returning(OrderItemEntity::as_returning())
                    .get_results(conn)
                    .await
                    .context("Failed to create order items")?;

                if totals.points_redeemed > 0 {
                    loyalty::record_points(
                        conn,
                        user.id,
                        Some(order.id),
                        -totals.points_redeemed,
                        loyalty::REASON_REDEEMED,
                    )
                    .await?;
                }

                diesel::delete(cart_items::table.filter(cart_items::cart_id.eq(cart.id)))
                    .execute(conn)
                    .await
                    .context("Failed to empty cart")?;

                publish_status(conn, &order).await?;

                Ok::<OrderWithItems, AppError>(OrderWithItems { order, order_items })
            })
        })
        .await?;

    tracing::info!(
        "Order {} placed by user #{} for {}",
        placed.order.order_number,
        placed.order.user_id,
        placed.order.total
    );

    Ok(StdResponse {
        data: Some(placed),
        message: Some("Placed order successfully"),
    })
}

/// Cancel a pending order of the authenticated customer.
#[utoipa::path(
    delete,
    path = "/{id}",
    tags = ["Orders"],
    security(("bearerAuth" = [])),
    params(
        ("id" = i32, Path, description = "Order ID to cancel")
    ),
    responses(
        (status = 200, description = "Cancelled order successfully", body = StdResponse<OrderEntity, String>),
        (status = 400, description = "The order is past the pending stage"),
        (status = 404, description = "Order not found")
    )
)]
async fn cancel_my_order(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let points_per_unit = state.config.ordering.loyalty_points_per_unit;

    let order = conn
        .transaction(move |conn| {
            Box::pin(async move {
                let order = owned_order(conn, id, user.id).await?;
                if order.status != OrderStatus::Pending.as_str() {
                    return Err(AppError::BadRequest(
                        "Only pending orders can be cancelled".into(),
                    ));
                }
                change_status(conn, order.id, OrderStatus::Cancelled, points_per_unit).await
            })
        })
        .await?;

    Ok(StdResponse {
        data: Some(order),
        message: Some("Cancelled order successfully"),
    })
}

#[derive(Serialize, ToSchema, Debug)]
pub struct CreatePaymentRes {
    pub payment: PaymentEntity,
    /// Handed to the gateway's client SDK to complete the payment.
    pub client_secret: Option<String>,
}

/// Start an online payment for a pending order.
#[utoipa::path(
    post,
    path = "/{id}/payment",
    tags = ["Orders"],
    security(("bearerAuth" = [])),
    params(
        ("id" = i32, Path, description = "Order ID to pay for")
    ),
    responses(
        (status = 200, description = "Created payment successfully", body = StdResponse<CreatePaymentRes, String>),
        (status = 400, description = "The order is not payable online"),
        (status = 409, description = "The order is already paid"),
        (status = 503, description = "Payment gateway unavailable")
    )
)]
async fn create_payment(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let order = owned_order(conn, id, user.id).await?;
    if order.payment_method != PaymentMethod::Online.as_str() {
        return Err(AppError::BadRequest(
            "Cash-on-delivery orders are paid on arrival".into(),
        ));
    }
    if order.status != OrderStatus::Pending.as_str() {
        return Err(AppError::BadRequest("Only pending orders can be paid".into()));
    }

    let paid: i64 = payments::table
        .filter(payments::order_id.eq(order.id))
        .filter(payments::status.eq(PAYMENT_PAID))
        .count()
        .get_result(conn)
        .await
        .context("Failed to check payments")?;
    if paid > 0 {
        return Err(AppError::Conflict("This order is already paid".into()));
    }

    let intent = payment_gateway::create_payment_intent(
        &state.http_client,
        &state.config.payments,
        order.total,
        &state.config.ordering.currency,
        &order.order_number,
    )
    .await?;

    let payment: PaymentEntity = diesel::insert_into(payments::table)
        .values(CreatePaymentEntity {
            order_id: order.id,
            amount: order.total,
            currency: state.config.ordering.currency.clone(),
            provider: payment_gateway::PROVIDER.into(),
            provider_ref: Some(intent.id),
            status: PAYMENT_PENDING.into(),
        })
        .returning(PaymentEntity::as_returning())
        .get_result(conn)
        .await
        .context("Failed to create payment")?;

    Ok(StdResponse {
        data: Some(CreatePaymentRes {
            payment,
            client_secret: intent.client_secret,
        }),
        message: Some("Created payment successfully"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_order_request() {
        let req: PlaceOrderReq = serde_json::from_value(serde_json::json!({
            "fulfillment": "delivery",
            "payment_method": "cod",
            "address_id": 4,
            "coupon_code": "FEAST20"
        }))
        .unwrap();
        assert_eq!(req.fulfillment, Fulfillment::Delivery);
        assert_eq!(req.payment_method, PaymentMethod::Cod);
        assert!(!req.redeem_points);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn rejects_long_notes() {
        let req: PlaceOrderReq = serde_json::from_value(serde_json::json!({
            "fulfillment": "pickup",
            "payment_method": "online",
            "notes": "n".repeat(501)
        }))
        .unwrap();
        assert!(req.validate().unwrap_err().field_errors().contains_key("notes"));
    }

    #[test]
    fn snapshots_address_fields() {
        let now = Utc::now();
        let address = AddressEntity {
            id: 3,
            user_id: 9,
            label: "Home".into(),
            line1: "12 Curry Lane".into(),
            line2: None,
            city: "Pune".into(),
            postal_code: "411001".into(),
            landmark: Some("Opposite the park".into()),
            is_default: true,
            created_at: now,
            updated_at: now,
        };
        let snapshot = address_snapshot(&address).unwrap();
        assert_eq!(snapshot["line1"], "12 Curry Lane");
        assert_eq!(snapshot["landmark"], "Opposite the park");
        assert!(snapshot.get("user_id").is_none());
    }
}
