pub mod api;
pub mod consumers;
pub mod events;
pub mod models;
pub mod platform;
pub mod routes;
pub mod schema;
pub mod services;

use anyhow::Result;
use axum::Router;

use crate::platform::{app_state::AppState, bootstrap, swagger};

/// Assembles the HTTP application: routes, Swagger UI and shared layers.
pub fn build_app(state: AppState) -> Result<Router> {
    let (router, mut openapi) = routes::routes_with_openapi(&state).split_for_parts();
    openapi.info = utoipa::openapi::InfoBuilder::new()
        .title("Tastebud FoodService API")
        .version(env!("CARGO_PKG_VERSION"))
        .build();
    let swagger_ui = swagger::create_swagger_ui(openapi)?;

    let app = router.with_state(state).merge(swagger_ui);
    Ok(bootstrap::with_layers(app))
}
