use anyhow::Context;
use axum::{
    Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use diesel::{ExpressionMethods, QueryDsl, SelectableHelper, pg::Pg};
use diesel_async::{AsyncConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use utoipa_axum::router::OpenApiRouter;

use crate::{
    models::{OrderEntity, PaymentEntity},
    platform::{
        app_error::{AppError, StdResponse},
        app_state::AppState,
        pagination::{PageParams, Paginated},
    },
    schema::{orders, payments},
    services::{
        order_status::OrderStatus,
        orders::{OrderWithItems, change_status, load_order_items, with_items},
    },
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/orders",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(list_orders))
            .routes(utoipa_axum::routes!(get_order))
            .routes(utoipa_axum::routes!(update_status)),
    )
}

#[derive(Deserialize, IntoParams, Debug, Default)]
#[into_params(parameter_in = Query)]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
    pub user_id: Option<i32>,
}

fn filtered_orders(filter: &OrderFilter) -> orders::BoxedQuery<'static, Pg> {
    let mut query = orders::table.into_boxed();
    if let Some(status) = filter.status {
        query = query.filter(orders::status.eq(status.as_str()));
    }
    if let Some(user_id) = filter.user_id {
        query = query.filter(orders::user_id.eq(user_id));
    }
    query
}

/// Fetch orders, newest first.
#[utoipa::path(
    get,
    path = "/",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    params(OrderFilter, PageParams),
    responses(
        (status = 200, description = "Get orders successfully", body = StdResponse<Paginated<OrderWithItems>, String>)
    )
)]
async fn list_orders(
    State(state): State<AppState>,
    Query(filter): Query<OrderFilter>,
    Query(page): Query<PageParams>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let total: i64 = filtered_orders(&filter)
        .count()
        .get_result(conn)
        .await
        .context("Failed to count orders")?;

    let result: Vec<OrderEntity> = filtered_orders(&filter)
        .order_by(orders::created_at.desc())
        .limit(page.per_page())
        .offset(page.offset())
        .select(OrderEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to get orders")?;

    let items = with_items(conn, result).await?;

    Ok(StdResponse {
        data: Some(Paginated::new(items, page, total)),
        message: Some("Get orders successfully"),
    })
}

#[derive(Serialize, ToSchema, Debug)]
pub struct AdminOrderDetail {
    #[serde(flatten)]
    pub order: OrderWithItems,
    pub payments: Vec<PaymentEntity>,
}

/// Fetch an order with its items and payment attempts.
#[utoipa::path(
    get,
    path = "/{id}",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    params(
        ("id" = i32, Path, description = "Order ID")
    ),
    responses(
        (status = 200, description = "Get order successfully", body = StdResponse<AdminOrderDetail, String>),
        (status = 404, description = "Order not found")
    )
)]
async fn get_order(
    Path(id): Path<i32>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let order: OrderEntity = orders::table
        .find(id)
        .select(OrderEntity::as_select())
        .get_result(conn)
        .await?;

    let order_items = load_order_items(conn, &[order.id])
        .await?
        .remove(&order.id)
        .unwrap_or_default();

    let order_payments: Vec<PaymentEntity> = payments::table
        .filter(payments::order_id.eq(order.id))
        .order_by(payments::created_at.asc())
        .select(PaymentEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to get payments")?;

    Ok(StdResponse {
        data: Some(AdminOrderDetail {
            order: OrderWithItems { order, order_items },
            payments: order_payments,
        }),
        message: Some("Get order successfully"),
    })
}

#[derive(Deserialize, ToSchema, Debug)]
pub struct UpdateStatusReq {
    pub status: OrderStatus,
}

/// Move an order along its status line, or cancel it.
#[utoipa::path(
    patch,
    path = "/{id}/status",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    params(
        ("id" = i32, Path, description = "Order ID")
    ),
    request_body = UpdateStatusReq,
    responses(
        (status = 200, description = "Updated order status successfully", body = StdResponse<OrderEntity, String>),
        (status = 400, description = "Transition not allowed"),
        (status = 404, description = "Order not found"),
        (status = 409, description = "Order changed concurrently")
    )
)]
async fn update_status(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Json(body): Json<UpdateStatusReq>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let points_per_unit = state.config.ordering.loyalty_points_per_unit;

    let order = conn
        .transaction(move |conn| {
            Box::pin(async move { change_status(conn, id, body.status, points_per_unit).await })
        })
        .await?;

    Ok(StdResponse {
        data: Some(order),
        message: Some("Updated order status successfully"),
    })
}

#[cfg(test)]
mod tests {
    use diesel::debug_query;

    use super::*;

    #[test]
    fn filters_by_status_and_user() {
        let filter = OrderFilter {
            status: Some(OrderStatus::OutForDelivery),
            user_id: Some(7),
        };
        let sql = debug_query::<Pg, _>(&filtered_orders(&filter)).to_string();
        assert!(sql.contains("\"orders\".\"status\" = $1"));
        assert!(sql.contains("\"orders\".\"user_id\" = $2"));
        assert!(sql.contains("out_for_delivery"));
    }

    #[test]
    fn parses_status_query() {
        let req: UpdateStatusReq =
            serde_json::from_value(serde_json::json!({ "status": "preparing" })).unwrap();
        assert_eq!(req.status, OrderStatus::Preparing);
    }
}
