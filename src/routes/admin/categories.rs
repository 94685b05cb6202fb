use anyhow::Context;
use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};
use diesel::{ExpressionMethods, QueryDsl, SelectableHelper};
use diesel_async::RunQueryDsl;
use serde::Deserialize;
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;
use validator::Validate;

use crate::{
    models::{CategoryEntity, CreateCategoryEntity, UpdateCategoryEntity},
    platform::{
        app_error::{AppError, StdResponse},
        app_state::AppState,
    },
    schema::{categories, menu_items},
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/categories",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(list_categories, create_category))
            .routes(utoipa_axum::routes!(update_category, delete_category)),
    )
}

/// Fetch all categories.
#[utoipa::path(
    get,
    path = "/",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    responses(
        (status = 200, description = "Get categories successfully", body = StdResponse<Vec<CategoryEntity>, String>)
    )
)]
async fn list_categories(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let result: Vec<CategoryEntity> = categories::table
        .order_by((categories::sort_order.asc(), categories::name.asc()))
        .select(CategoryEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to get categories")?;

    Ok(StdResponse {
        data: Some(result),
        message: Some("Get categories successfully"),
    })
}

#[derive(Deserialize, Validate, ToSchema, Debug)]
pub struct CreateCategoryReq {
    #[validate(length(min = 1, max = 64))]
    pub name: String,
    #[validate(length(max = 1000))]
    pub description: Option<String>,
    #[validate(url)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub sort_order: i32,
}

/// Create a category.
#[utoipa::path(
    post,
    path = "/",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    request_body = CreateCategoryReq,
    responses(
        (status = 200, description = "Created category successfully", body = StdResponse<CategoryEntity, String>),
        (status = 409, description = "Category name already taken")
    )
)]
async fn create_category(
    State(state): State<AppState>,
    Json(body): Json<CreateCategoryReq>,
) -> Result<impl IntoResponse, AppError> {
    body.validate()?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let category: CategoryEntity = diesel::insert_into(categories::table)
        .values(CreateCategoryEntity {
            name: body.name.trim().to_owned(),
            description: body.description,
            image_url: body.image_url,
            sort_order: body.sort_order,
        })
        .returning(CategoryEntity::as_returning())
        .get_result(conn)
        .await?;

    Ok(StdResponse {
        data: Some(category),
        message: Some("Created category successfully"),
    })
}

#[derive(Deserialize, Validate, ToSchema, Debug)]
pub struct UpdateCategoryReq {
    #[validate(length(min = 1, max = 64))]
    pub name: Option<String>,
    #[validate(length(max = 1000))]
    pub description: Option<String>,
    #[validate(url)]
    pub image_url: Option<String>,
    pub sort_order: Option<i32>,
}

/// Update a category.
#[utoipa::path(
    patch,
    path = "/{id}",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    params(
        ("id" = i32, Path, description = "Category ID")
    ),
    request_body = UpdateCategoryReq,
    responses(
        (status = 200, description = "Updated category successfully", body = StdResponse<CategoryEntity, String>),
        (status = 404, description = "Category not found")
    )
)]
async fn update_category(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Json(body): Json<UpdateCategoryReq>,
) -> Result<impl IntoResponse, AppError> {
    body.validate()?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let category: CategoryEntity = diesel::update(categories::table.find(id))
        .set((
            UpdateCategoryEntity {
                name: body.name.map(|name| name.trim().to_owned()),
                description: body.description,
                image_url: body.image_url,
                sort_order: body.sort_order,
            },
            categories::updated_at.eq(diesel::dsl::now),
        ))
        .returning(CategoryEntity::as_returning())
        .get_result(conn)
        .await?;

    Ok(StdResponse {
        data: Some(category),
        message: Some("Updated category successfully"),
    })
}

/// Delete a category that no menu item uses.
#[utoipa::path(
    delete,
    path = "/{id}",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    params(
        ("id" = i32, Path, description = "Category ID")
    ),
    responses(
        (status = 200, description = "Deleted category successfully", body = StdResponse<CategoryEntity, String>),
        (status = 400, description = "Menu items still use this category"),
        (status = 404, description = "Category not found")
    )
)]
async fn delete_category(
    Path(id): Path<i32>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let in_use: i64 = menu_items::table
        .filter(menu_items::category_id.eq(id))
        .count()
        .get_result(conn)
        .await
        .context("Failed to count menu items")?;
    if in_use > 0 {
        return Err(AppError::BadRequest(format!(
            "{in_use} menu item(s) still belong to this category"
        )));
    }

    // A menu item added concurrently trips the foreign key and also surfaces as 400.
    let category: CategoryEntity = diesel::delete(categories::table.find(id))
        .returning(CategoryEntity::as_returning())
        .get_result(conn)
        .await?;

    Ok(StdResponse {
        data: Some(category),
        message: Some("Deleted category successfully"),
    })
}
