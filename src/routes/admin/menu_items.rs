use anyhow::Context;
use axum::{
    Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use diesel::{ExpressionMethods, QueryDsl, SelectableHelper};
use diesel_async::RunQueryDsl;
use rust_decimal::Decimal;
use serde::Deserialize;
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;
use validator::{Validate, ValidationError};

use crate::{
    models::{CreateMenuItemEntity, MenuItemEntity, UpdateMenuItemEntity},
    platform::{
        app_error::{AppError, StdResponse},
        app_state::AppState,
        pagination::{PageParams, Paginated},
    },
    routes::menu::{MenuFilter, filtered_menu_items},
    schema::menu_items,
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/menu-items",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(list_menu_items, create_menu_item))
            .routes(utoipa_axum::routes!(update_menu_item, delete_menu_item))
            .routes(utoipa_axum::routes!(set_availability)),
    )
}

/// Largest value a `NUMERIC(10, 2)` price column holds, 99,999,999.99.
pub const MAX_PRICE: Decimal = Decimal::from_parts(1_410_065_407, 2, 0, false, 2);

fn validate_price(price: &Decimal) -> Result<(), ValidationError> {
    if price.is_sign_negative() || price.scale() > 2 || *price > MAX_PRICE {
        return Err(ValidationError::new("price"));
    }
    Ok(())
}

/// Fetch menu items including unavailable ones unless `available_only` is set.
#[utoipa::path(
    get,
    path = "/",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    params(MenuFilter, PageParams),
    responses(
        (status = 200, description = "Get menu items successfully", body = StdResponse<Paginated<MenuItemEntity>, String>)
    )
)]
async fn list_menu_items(
    State(state): State<AppState>,
    Query(filter): Query<MenuFilter>,
    Query(page): Query<PageParams>,
) -> Result<impl IntoResponse, AppError> {
    let filter = MenuFilter {
        available_only: Some(filter.available_only.unwrap_or(false)),
        ..filter
    };

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let total: i64 = filtered_menu_items(&filter)
        .count()
        .get_result(conn)
        .await
        .context("Failed to count menu items")?;

    let items: Vec<MenuItemEntity> = filtered_menu_items(&filter)
        .order_by(menu_items::id.asc())
        .limit(page.per_page())
        .offset(page.offset())
        .select(MenuItemEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to get menu items")?;

    Ok(StdResponse {
        data: Some(Paginated::new(items, page, total)),
        message: Some("Get menu items successfully"),
    })
}

#[derive(Deserialize, Validate, ToSchema, Debug)]
pub struct CreateMenuItemReq {
    pub category_id: i32,
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    #[validate(length(max = 2000))]
    pub description: Option<String>,
    #[validate(custom(function = "validate_price"))]
    pub price: Decimal,
    #[validate(url)]
    pub image_url: Option<String>,
    #[serde(default = "default_true")]
    pub is_available: bool,
    #[serde(default)]
    pub is_vegetarian: bool,
    #[serde(default)]
    pub is_featured: bool,
}

fn default_true() -> bool {
    true
}

/// Create a menu item.
#[utoipa::path(
    post,
    path = "/",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    request_body = CreateMenuItemReq,
    responses(
        (status = 200, description = "Created menu item successfully", body = StdResponse<MenuItemEntity, String>),
        (status = 400, description = "Invalid fields or unknown category")
    )
)]
async fn create_menu_item(
    State(state): State<AppState>,
    Json(body): Json<CreateMenuItemReq>,
) -> Result<impl IntoResponse, AppError> {
    body.validate()?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let item: MenuItemEntity = diesel::insert_into(menu_items::table)
        .values(CreateMenuItemEntity {
            category_id: body.category_id,
            name: body.name.trim().to_owned(),
            description: body.description,
            price: body.price,
            image_url: body.image_url,
            is_available: body.is_available,
            is_vegetarian: body.is_vegetarian,
            is_featured: body.is_featured,
        })
        .returning(MenuItemEntity::as_returning())
        .get_result(conn)
        .await?;

    tracing::info!("Created menu item #{} {}", item.id, item.name);

    Ok(StdResponse {
        data: Some(item),
        message: Some("Created menu item successfully"),
    })
}

#[derive(Deserialize, Validate, ToSchema, Debug)]
pub struct UpdateMenuItemReq {
    pub category_id: Option<i32>,
    #[validate(length(min = 1, max = 128))]
    pub name: Option<String>,
    #[validate(length(max = 2000))]
    pub description: Option<String>,
    #[validate(custom(function = "validate_price"))]
    pub price: Option<Decimal>,
    #[validate(url)]
    pub image_url: Option<String>,
    pub is_vegetarian: Option<bool>,
    pub is_featured: Option<bool>,
}

/// Update a menu item. Availability has its own endpoint.
#[utoipa::path(
    patch,
    path = "/{id}",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    params(
        ("id" = i32, Path, description = "Menu item ID")
    ),
    request_body = UpdateMenuItemReq,
    responses(
        (status = 200, description = "Updated menu item successfully", body = StdResponse<MenuItemEntity, String>),
        (status = 404, description = "Menu item not found")
    )
)]
async fn update_menu_item(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Json(body): Json<UpdateMenuItemReq>,
) -> Result<impl IntoResponse, AppError> {
    body.validate()?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let item: MenuItemEntity = diesel::update(menu_items::table.find(id))
        .set((
            UpdateMenuItemEntity {
                category_id: body.category_id,
                name: body.name.map(|name| name.trim().to_owned()),
                description: body.description,
                price: body.price,
                image_url: body.image_url,
                is_vegetarian: body.is_vegetarian,
                is_featured: body.is_featured,
            },
            menu_items::updated_at.eq(diesel::dsl::now),
        ))
        .returning(MenuItemEntity::as_returning())
        .get_result(conn)
        .await?;

    Ok(StdResponse {
        data: Some(item),
        message: Some("Updated menu item successfully"),
    })
}

/// Delete a menu item. Past orders keep their snapshot.
#[utoipa::path(
    delete,
    path = "/{id}",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    params(
        ("id" = i32, Path, description = "Menu item ID")
    ),
    responses(
        (status = 200, description = "Deleted menu item successfully", body = StdResponse<MenuItemEntity, String>),
        (status = 404, description = "Menu item not found")
    )
)]
async fn delete_menu_item(
    Path(id): Path<i32>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let item: MenuItemEntity = diesel::delete(menu_items::table.find(id))
        .returning(MenuItemEntity::as_returning())
        .get_result(conn)
        .await?;

    Ok(StdResponse {
        data: Some(item),
        message: Some("Deleted menu item successfully"),
    })
}

#[derive(Deserialize, ToSchema, Debug)]
pub struct SetAvailabilityReq {
    pub available: bool,
}

/// Switch a menu item on or off. Setting the current value again is a no-op.
#[utoipa::path(
    put,
    path = "/{id}/availability",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    params(
        ("id" = i32, Path, description = "Menu item ID")
    ),
    request_body = SetAvailabilityReq,
    responses(
        (status = 200, description = "Set availability successfully", body = StdResponse<MenuItemEntity, String>),
        (status = 404, description = "Menu item not found")
    )
)]
async fn set_availability(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Json(body): Json<SetAvailabilityReq>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let item: MenuItemEntity = menu_items::table
        .find(id)
        .select(MenuItemEntity::as_select())
        .get_result(conn)
        .await?;

    let Some(available) = availability_change(item.is_available, body.available) else {
        return Ok(StdResponse {
            data: Some(item),
            message: Some("Availability unchanged"),
        });
    };

    let item: MenuItemEntity = diesel::update(menu_items::table.find(id))
        .set((
            menu_items::is_available.eq(available),
            menu_items::updated_at.eq(diesel::dsl::now),
        ))
        .returning(MenuItemEntity::as_returning())
        .get_result(conn)
        .await?;

    tracing::info!(
        "Menu item #{} is now {}",
        item.id,
        if item.is_available { "available" } else { "unavailable" }
    );

    Ok(StdResponse {
        data: Some(item),
        message: Some("Set availability successfully"),
    })
}

/// The value to write, or `None` when the item already has it.
fn availability_change(current: bool, requested: bool) -> Option<bool> {
    (current != requested).then_some(requested)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_availability_requests_write_nothing() {
        assert_eq!(availability_change(true, true), None);
        assert_eq!(availability_change(false, false), None);
        assert_eq!(availability_change(true, false), Some(false));
        assert_eq!(availability_change(false, true), Some(true));
    }

    #[test]
    fn prices_fit_the_column() {
        assert_eq!(MAX_PRICE, Decimal::new(9_999_999_999, 2));
        assert!(validate_price(&MAX_PRICE).is_ok());
        assert!(validate_price(&Decimal::new(10_000_000_000, 2)).is_err());
        assert!(validate_price(&Decimal::from(1_000_000_000_000_i64)).is_err());
    }

    #[test]
    fn prices_must_be_non_negative_cents() {
        assert!(validate_price(&Decimal::new(24950, 2)).is_ok());
        assert!(validate_price(&Decimal::ZERO).is_ok());
        assert!(validate_price(&Decimal::new(-100, 2)).is_err());
        assert!(validate_price(&Decimal::new(12345, 3)).is_err());
    }

    #[test]
    fn new_items_default_to_available() {
        let req: CreateMenuItemReq = serde_json::from_value(serde_json::json!({
            "category_id": 1,
            "name": "Paneer tikka",
            "price": "249.50"
        }))
        .unwrap();
        assert!(req.is_available);
        assert!(!req.is_vegetarian);
        assert!(req.validate().is_ok());
    }
}
