use std::collections::BTreeMap;

use anyhow::Context;
use axum::{extract::State, response::IntoResponse};
use chrono::{DateTime, NaiveTime, Utc};
use diesel::{ExpressionMethods, QueryDsl, dsl};
use diesel_async::RunQueryDsl;
use rust_decimal::Decimal;
use serde::Serialize;
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;

use crate::{
    platform::{
        app_error::{AppError, StdResponse},
        app_state::AppState,
        middleware::ROLE_CUSTOMER,
    },
    schema::{orders, users},
    services::order_status::OrderStatus,
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/dashboard",
        OpenApiRouter::new().routes(utoipa_axum::routes!(get_dashboard)),
    )
}

#[derive(Serialize, ToSchema, Debug)]
pub struct DashboardSummary {
    pub orders_today: i64,
    /// Sum of delivered order totals placed today.
    pub revenue_today: Decimal,
    pub pending_orders: i64,
    pub customer_count: i64,
    /// Every status is present, zero when no order has it.
    pub orders_by_status: BTreeMap<String, i64>,
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

fn status_counts(rows: Vec<(String, i64)>) -> BTreeMap<String, i64> {
    let mut counts: BTreeMap<String, i64> = OrderStatus::ALL
        .iter()
        .map(|status| (status.as_str().to_owned(), 0))
        .collect();
    for (status, count) in rows {
        *counts.entry(status).or_default() += count;
    }
    counts
}

/// Headline numbers for the admin dashboard. Days are UTC.
#[utoipa::path(
    get,
    path = "/",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    responses(
        (status = 200, description = "Get dashboard successfully", body = StdResponse<DashboardSummary, String>)
    )
)]
async fn get_dashboard(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let today = start_of_day(Utc::now());

    let orders_today: i64 = orders::table
        .filter(orders::created_at.ge(today))
        .count()
        .get_result(conn)
        .await
        .context("Failed to count today's orders")?;

    let revenue_today: Option<Decimal> = orders::table
        .filter(orders::created_at.ge(today))
        .filter(orders::status.eq(OrderStatus::Delivered.as_str()))
        .select(dsl::sum(orders::total))
        .get_result(conn)
        .await
        .context("Failed to sum today's revenue")?;

    let pending_orders: i64 = orders::table
        .filter(orders::status.eq(OrderStatus::Pending.as_str()))
        .count()
        .get_result(conn)
        .await
        .context("Failed to count pending orders")?;

    let customer_count: i64 = users::table
        .filter(users::role.eq(ROLE_CUSTOMER))
        .filter(users::deleted_at.is_null())
        .count()
        .get_result(conn)
        .await
        .context("Failed to count customers")?;

    let by_status: Vec<(String, i64)> = orders::table
        .group_by(orders::status)
        .select((orders::status, dsl::count_star()))
        .get_results(conn)
        .await
        .context("Failed to count orders by status")?;

    Ok(StdResponse {
        data: Some(DashboardSummary {
            orders_today,
            revenue_today: revenue_today.unwrap_or(Decimal::ZERO),
            pending_orders,
            customer_count,
            orders_by_status: status_counts(by_status),
        }),
        message: Some("Get dashboard successfully"),
    })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn day_starts_at_utc_midnight() {
        let now = Utc.with_ymd_and_hms(2026, 3, 14, 18, 45, 12).unwrap();
        assert_eq!(
            start_of_day(now),
            Utc.with_ymd_and_hms(2026, 3, 14, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn fills_missing_statuses_with_zero() {
        let counts = status_counts(vec![("pending".into(), 3), ("delivered".into(), 9)]);
        assert_eq!(counts.len(), OrderStatus::ALL.len());
        assert_eq!(counts["pending"], 3);
        assert_eq!(counts["delivered"], 9);
        assert_eq!(counts["cancelled"], 0);
    }
}
