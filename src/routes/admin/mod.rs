//! Back-office routes. Every route requires an admin bearer token.

use utoipa_axum::router::OpenApiRouter;

use crate::platform::{app_state::AppState, middleware};

pub mod categories;
pub mod dashboard;
pub mod menu_items;
pub mod offers;
pub mod orders;
pub mod uploads;
pub mod users;

pub fn routes_with_openapi(state: &AppState) -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/admin",
        OpenApiRouter::new()
            .merge(categories::routes_with_openapi())
            .merge(menu_items::routes_with_openapi())
            .merge(orders::routes_with_openapi())
            .merge(offers::routes_with_openapi())
            .merge(users::routes_with_openapi())
            .merge(dashboard::routes_with_openapi())
            .merge(uploads::routes_with_openapi())
            .route_layer(axum::middleware::from_fn_with_state(
                state.clone(),
                middleware::admins_authorization,
            )),
    )
}
