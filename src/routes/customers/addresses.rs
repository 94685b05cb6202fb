use anyhow::Context;
use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::Deserialize;
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;
use validator::Validate;

use crate::{
    models::{AddressEntity, CreateAddressEntity, UpdateAddressEntity},
    platform::{
        app_error::{AppError, StdResponse},
        app_state::AppState,
        middleware::{self, AuthUser},
    },
    schema::addresses,
};

pub fn routes_with_openapi(state: &AppState) -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/customers/addresses",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(list_addresses, create_address))
            .routes(utoipa_axum::routes!(update_address, delete_address))
            .routes(utoipa_axum::routes!(set_default_address))
            .route_layer(axum::middleware::from_fn_with_state(
                state.clone(),
                middleware::customers_authorization,
            )),
    )
}

async fn clear_default(conn: &mut AsyncPgConnection, user_id: i32) -> Result<(), AppError> {
    diesel::update(
        addresses::table
            .filter(addresses::user_id.eq(user_id))
            .filter(addresses::is_default.eq(true)),
    )
    .set((
        addresses::is_default.eq(false),
        addresses::updated_at.eq(diesel::dsl::now),
    ))
    .execute(conn)
    .await
    .context("Failed to clear default address")?;
    Ok(())
}

/// Fetch the authenticated user's addresses, default first.
#[utoipa::path(
    get,
    path = "/",
    tags = ["Addresses"],
    security(("bearerAuth" = [])),
    responses(
        (status = 200, description = "Get addresses successfully", body = StdResponse<Vec<AddressEntity>, String>)
    )
)]
async fn list_addresses(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let result: Vec<AddressEntity> = addresses::table
        .filter(addresses::user_id.eq(user.id))
        .order_by((addresses::is_default.desc(), addresses::id.asc()))
        .select(AddressEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to get addresses")?;

    Ok(StdResponse {
        data: Some(result),
        message: Some("Get addresses successfully"),
    })
}

#[derive(Deserialize, Validate, ToSchema, Debug)]
pub struct CreateAddressReq {
    #[validate(length(min = 1, max = 32))]
    pub label: String,
    #[validate(length(min = 1, max = 200))]
    pub line1: String,
    #[validate(length(max = 200))]
    pub line2: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub city: String,
    #[validate(length(min = 3, max = 16))]
    pub postal_code: String,
    #[validate(length(max = 200))]
    pub landmark: Option<String>,
    #[serde(default)]
    pub is_default: bool,
}

/// Add an address. The first address becomes the default.
#[utoipa::path(
    post,
    path = "/",
    tags = ["Addresses"],
    security(("bearerAuth" = [])),
    request_body = CreateAddressReq,
    responses(
        (status = 200, description = "Created address successfully", body = StdResponse<AddressEntity, String>)
    )
)]
async fn create_address(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<CreateAddressReq>,
) -> Result<impl IntoResponse, AppError> {
    body.validate()?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let address = conn
        .transaction(move |conn| {
            Box::pin(async move {
                let existing: i64 = addresses::table
                    .filter(addresses::user_id.eq(user.id))
                    .count()
                    .get_result(conn)
                    .await
                    .context("Failed to count addresses")?;

                let is_default = body.is_default || existing == 0;
                if is_default {
                    clear_default(conn, user.id).await?;
                }

                let address = diesel::insert_into(addresses::table)
                    .values(CreateAddressEntity {
                        user_id: user.id,
                        label: body.label,
                        line1: body.line1,
                        line2: body.line2,
                        city: body.city,
                        postal_code: body.postal_code,
                        landmark: body.landmark,
                        is_default,
                    })
                    .returning(AddressEntity::as_returning())
                    .get_result(conn)
                    .await
                    .context("Failed to create address")?;

                Ok::<AddressEntity, AppError>(address)
            })
        })
        .await?;

    Ok(StdResponse {
        data: Some(address),
        message: Some("Created address successfully"),
    })
}

#[derive(Deserialize, Validate, ToSchema, Debug)]
pub struct UpdateAddressReq {
    #[validate(length(min = 1, max = 32))]
    pub label: Option<String>,
    #[validate(length(min = 1, max = 200))]
    pub line1: Option<String>,
    #[validate(length(max = 200))]
    pub line2: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub city: Option<String>,
    #[validate(length(min = 3, max = 16))]
    pub postal_code: Option<String>,
    #[validate(length(max = 200))]
    pub landmark: Option<String>,
}

impl UpdateAddressReq {
    fn into_changeset(self) -> Option<UpdateAddressEntity> {
        let changes = UpdateAddressEntity {
            label: self.label,
            line1: self.line1,
            line2: self.line2,
            city: self.city,
            postal_code: self.postal_code,
            landmark: self.landmark,
        };
        let empty = changes.label.is_none()
            && changes.line1.is_none()
            && changes.line2.is_none()
            && changes.city.is_none()
            && changes.postal_code.is_none()
            && changes.landmark.is_none();
        (!empty).then_some(changes)
    }
}

/// Edit one of the authenticated user's addresses.
#[utoipa::path(
    patch,
    path = "/{id}",
    tags = ["Addresses"],
    security(("bearerAuth" = [])),
    params(
        ("id" = i32, Path, description = "Address ID")
    ),
    request_body = UpdateAddressReq,
    responses(
        (status = 200, description = "Updated address successfully", body = StdResponse<AddressEntity, String>),
        (status = 404, description = "Address not found")
    )
)]
async fn update_address(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<UpdateAddressReq>,
) -> Result<impl IntoResponse, AppError> {
    body.validate()?;
    let changes = body
        .into_changeset()
        .ok_or_else(|| AppError::BadRequest("Nothing to update".into()))?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let address: AddressEntity = diesel::update(
        addresses::table
            .find(id)
            .filter(addresses::user_id.eq(user.id)),
    )
    .set((changes, addresses::updated_at.eq(diesel::dsl::now)))
    .returning(AddressEntity::as_returning())
    .get_result(conn)
    .await?;

    Ok(StdResponse {
        data: Some(address),
        message: Some("Updated address successfully"),
    })
}

/// Delete an address. Removing the default promotes the most recent remaining address.
#[utoipa::path(
    delete,
    path = "/{id}",
    tags = ["Addresses"],
    security(("bearerAuth" = [])),
    params(
        ("id" = i32, Path, description = "Address ID")
    ),
    responses(
        (status = 200, description = "Deleted address successfully", body = StdResponse<AddressEntity, String>),
        (status = 404, description = "Address not found")
    )
)]
async fn delete_address(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let deleted = conn
        .transaction(move |conn| {
            Box::pin(async move {
                let deleted: AddressEntity = diesel::delete(
                    addresses::table
                        .find(id)
                        .filter(addresses::user_id.eq(user.id)),
                )
                .returning(AddressEntity::as_returning())
                .get_result(conn)
                .await?;

                if deleted.is_default {
                    let next: Option<i32> = addresses::table
                        .filter(addresses::user_id.eq(user.id))
                        .order_by(addresses::id.desc())
                        .select(addresses::id)
                        .first(conn)
                        .await
                        .optional()
                        .context("Failed to find next default address")?;

                    if let Some(next) = next {
                        diesel::update(addresses::table.find(next))
                            .set(addresses::is_default.eq(true))
                            .execute(conn)
                            .await
                            .context("Failed to promote default address")?;
                    }
                }

                Ok::<AddressEntity, AppError>(deleted)
            })
        })
        .await?;

    Ok(StdResponse {
        data: Some(deleted),
        message: Some("Deleted address successfully"),
    })
}

/// Make an address the default one.
#[utoipa::path(
    put,
    path = "/{id}/default",
    tags = ["Addresses"],
    security(("bearerAuth" = [])),
    params(
        ("id" = i32, Path, description = "Address ID")
    ),
    responses(
        (status = 200, description = "Set default address successfully", body = StdResponse<AddressEntity, String>),
        (status = 404, description = "Address not found")
    )
)]
async fn set_default_address(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let address = conn
        .transaction(move |conn| {
            Box::pin(async move {
                let address: AddressEntity = addresses::table
                    .find(id)
                    .filter(addresses::user_id.eq(user.id))
                    .select(AddressEntity::as_select())
                    .get_result(conn)
                    .await?;
                if address.is_default {
                    return Ok(address);
                }

                clear_default(conn, user.id).await?;

                let address: AddressEntity = diesel::update(addresses::table.find(address.id))
                    .set((
                        addresses::is_default.eq(true),
                        addresses::updated_at.eq(diesel::dsl::now),
                    ))
                    .returning(AddressEntity::as_returning())
                    .get_result(conn)
                    .await?;

                Ok::<AddressEntity, AppError>(address)
            })
        })
        .await?;

    Ok(StdResponse {
        data: Some(address),
        message: Some("Set default address successfully"),
    })
}
