use axum::response::IntoResponse;
use serde::Serialize;
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;

use crate::platform::{app_error::StdResponse, app_state::AppState};

pub mod admin;
pub mod carts;
pub mod customers;
pub mod menu;
pub mod offers;
pub mod webhooks;

/// Every HTTP route of the service.
pub fn routes_with_openapi(state: &AppState) -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .routes(utoipa_axum::routes!(health))
        .merge(menu::routes_with_openapi())
        .merge(carts::routes_with_openapi(state))
        .merge(offers::routes_with_openapi(state))
        .merge(customers::routes_with_openapi(state))
        .merge(webhooks::routes_with_openapi())
        .merge(admin::routes_with_openapi(state))
}

#[derive(Serialize, ToSchema, Debug)]
pub struct Health {
    pub status: &'static str,
}

/// Liveness check.
#[utoipa::path(
    get,
    path = "/health",
    tags = ["Health"],
    responses(
        (status = 200, description = "Service is up", body = StdResponse<Health, String>)
    )
)]
async fn health() -> impl IntoResponse {
    StdResponse {
        data: Some(Health { status: "ok" }),
        message: Some("Service is up"),
    }
}
