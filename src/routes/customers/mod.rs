//! Routes for signed-in customers.

use utoipa_axum::router::OpenApiRouter;

use crate::platform::app_state::AppState;

pub mod addresses;
pub mod orders;
pub mod otp;
pub mod profile;

pub fn routes_with_openapi(state: &AppState) -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .merge(profile::routes_with_openapi(state))
        .merge(addresses::routes_with_openapi(state))
        .merge(orders::routes_with_openapi(state))
        .merge(otp::routes_with_openapi(state))
}
