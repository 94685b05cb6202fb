use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
};
use diesel::{
    BoolExpressionMethods, ExpressionMethods, PgTextExpressionMethods, QueryDsl, SelectableHelper,
    pg::Pg,
};
use diesel_async::RunQueryDsl;
use serde::Deserialize;
use utoipa::IntoParams;
use utoipa_axum::router::OpenApiRouter;

use crate::{
    models::{CategoryEntity, MenuItemEntity},
    platform::{
        app_error::{AppError, StdResponse},
        app_state::AppState,
        pagination::{PageParams, Paginated},
    },
    schema::{categories, menu_items},
};

/// Public catalog routes.
pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/menu",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(list_categories))
            .routes(utoipa_axum::routes!(list_menu_items))
            .routes(utoipa_axum::routes!(get_menu_item)),
    )
}

#[derive(Deserialize, IntoParams, Debug, Default)]
#[into_params(parameter_in = Query)]
pub struct MenuFilter {
    pub category_id: Option<i32>,
    /// Case-insensitive match on name or description.
    pub search: Option<String>,
    pub vegetarian: Option<bool>,
    pub featured: Option<bool>,
    /// Defaults to `true`; admins pass `false` to see hidden items.
    pub available_only: Option<bool>,
}

/// Escapes LIKE wildcards so user input matches literally.
pub fn like_pattern(search: &str) -> String {
    let escaped = search
        .trim()
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

pub fn filtered_menu_items(filter: &MenuFilter) -> menu_items::BoxedQuery<'static, Pg> {
    let mut query = menu_items::table.into_boxed();

    if let Some(category_id) = filter.category_id {
        query = query.filter(menu_items::category_id.eq(category_id));
    }
    if let Some(search) = filter.search.as_deref().filter(|s| !s.trim().is_empty()) {
        let pattern = like_pattern(search);
        query = query.filter(
            menu_items::name
                .ilike(pattern.clone())
                .or(menu_items::description.ilike(pattern)),
        );
    }
    if let Some(vegetarian) = filter.vegetarian {
        query = query.filter(menu_items::is_vegetarian.eq(vegetarian));
    }
    if let Some(featured) = filter.featured {
        query = query.filter(menu_items::is_featured.eq(featured));
    }
    if filter.available_only.unwrap_or(true) {
        query = query.filter(menu_items::is_available.eq(true));
    }

    query
}

/// List all categories.
#[utoipa::path(
    get,
    path = "/categories",
    tags = ["Menu"],
    responses(
        (status = 200, description = "List categories", body = StdResponse<Vec<CategoryEntity>, String>)
    )
)]
async fn list_categories(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let categories: Vec<CategoryEntity> = categories::table
        .order_by((categories::sort_order.asc(), categories::name.asc()))
        .select(CategoryEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to get categories")?;

    Ok(StdResponse {
        data: Some(categories),
        message: Some("Get categories successfully"),
    })
}

/// List menu items with filters and pagination.
#[utoipa::path(
    get,
    path = "/items",
    tags = ["Menu"],
    params(MenuFilter, PageParams),
    responses(
        (status = 200, description = "List menu items", body = StdResponse<Paginated<MenuItemEntity>, String>)
    )
)]
async fn list_menu_items(
    State(state): State<AppState>,
    Query(filter): Query<MenuFilter>,
    Query(page): Query<PageParams>,
) -> Result<impl IntoResponse, AppError> {
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
        .order_by((menu_items::is_featured.desc(), menu_items::name.asc()))
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

/// Fetch a single menu item.
#[utoipa::path(
    get,
    path = "/items/{id}",
    tags = ["Menu"],
    params(
        ("id" = i32, Path, description = "Menu item ID")
    ),
    responses(
        (status = 200, description = "Get menu item", body = StdResponse<MenuItemEntity, String>),
        (status = 404, description = "Menu item not found")
    )
)]
async fn get_menu_item(
    Path(id): Path<i32>,
    State(state): State<AppState>,
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

    Ok(StdResponse {
        data: Some(item),
        message: Some("Get menu item successfully"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("paneer"), "%paneer%");
        assert_eq!(like_pattern(" 100%_off "), "%100\\%\\_off%");
    }

    #[test]
    fn builds_sql_for_filters() {
        let filter = MenuFilter {
            category_id: Some(3),
            search: Some("tikka".into()),
            vegetarian: Some(true),
            featured: None,
            available_only: None,
        };
        let sql = diesel::debug_query::<Pg, _>(&filtered_menu_items(&filter)).to_string();
        let where_clause = sql.split(" WHERE ").nth(1).unwrap();
        assert!(where_clause.contains("\"menu_items\".\"category_id\" = $1"));
        assert!(where_clause.contains("ILIKE"));
        assert!(where_clause.contains("\"menu_items\".\"is_vegetarian\" = "));
        assert!(where_clause.contains("\"menu_items\".\"is_available\" = "));
        assert!(!where_clause.contains("is_featured"));
    }

    #[test]
    fn admins_can_include_unavailable_items() {
        let filter = MenuFilter {
            available_only: Some(false),
            ..Default::default()
        };
        let sql = diesel::debug_query::<Pg, _>(&filtered_menu_items(&filter)).to_string();
        assert!(!sql.contains(" WHERE "));
    }
}
