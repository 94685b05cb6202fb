use anyhow::Context;
use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use diesel::{
    BoolExpressionMethods, ExpressionMethods, PgTextExpressionMethods, QueryDsl, SelectableHelper,
    pg::Pg,
};
use diesel_async::{AsyncConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use utoipa_axum::router::OpenApiRouter;
use validator::Validate;

use crate::{
    models::{UpdateUserEntity, UserEntity},
    platform::{
        app_error::{AppError, StdResponse},
        app_state::AppState,
        middleware::{AuthUser, ROLE_ADMIN, ROLE_CUSTOMER},
        pagination::{PageParams, Paginated},
    },
    routes::menu::like_pattern,
    schema::users,
    services::loyalty,
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/users",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(list_users))
            .routes(utoipa_axum::routes!(change_role))
            .routes(utoipa_axum::routes!(adjust_points)),
    )
}

#[derive(Deserialize, Serialize, ToSchema, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Customer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => ROLE_ADMIN,
            Role::Customer => ROLE_CUSTOMER,
        }
    }
}

#[derive(Deserialize, IntoParams, Debug, Default)]
#[into_params(parameter_in = Query)]
pub struct UserFilter {
    pub role: Option<Role>,
    /// Case-insensitive match on name, email or phone.
    pub search: Option<String>,
}

fn filtered_users(filter: &UserFilter) -> users::BoxedQuery<'static, Pg> {
    let mut query = users::table
        .filter(users::deleted_at.is_null())
        .into_boxed();
    if let Some(role) = filter.role {
        query = query.filter(users::role.eq(role.as_str()));
    }
    if let Some(search) = filter.search.as_deref().filter(|s| !s.trim().is_empty()) {
        let pattern = like_pattern(search);
        query = query.filter(
            users::name
                .ilike(pattern.clone())
                .or(users::email.ilike(pattern.clone()))
                .or(users::phone.ilike(pattern)),
        );
    }
    query
}

/// Fetch users, newest first.
#[utoipa::path(
    get,
    path = "/",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    params(UserFilter, PageParams),
    responses(
        (status = 200, description = "Get users successfully", body = StdResponse<Paginated<UserEntity>, String>)
    )
)]
async fn list_users(
    State(state): State<AppState>,
    Query(filter): Query<UserFilter>,
    Query(page): Query<PageParams>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let total: i64 = filtered_users(&filter)
        .count()
        .get_result(conn)
        .await
        .context("Failed to count users")?;

    let items: Vec<UserEntity> = filtered_users(&filter)
        .order_by(users::id.desc())
        .limit(page.per_page())
        .offset(page.offset())
        .select(UserEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to get users")?;

    Ok(StdResponse {
        data: Some(Paginated::new(items, page, total)),
        message: Some("Get users successfully"),
    })
}

#[derive(Deserialize, ToSchema, Debug)]
pub struct ChangeRoleReq {
    pub role: Role,
}

/// Grant or revoke admin access.
#[utoipa::path(
    put,
    path = "/{id}/role",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    params(
        ("id" = i32, Path, description = "User ID")
    ),
    request_body = ChangeRoleReq,
    responses(
        (status = 200, description = "Changed role successfully", body = StdResponse<UserEntity, String>),
        (status = 400, description = "Admins cannot demote themselves"),
        (status = 404, description = "User not found")
    )
)]
async fn change_role(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Json(body): Json<ChangeRoleReq>,
) -> Result<impl IntoResponse, AppError> {
    if admin.id == id && body.role != Role::Admin {
        return Err(AppError::BadRequest("You cannot remove your own admin role".into()));
    }

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let user: UserEntity = diesel::update(
        users::table
            .find(id)
            .filter(users::deleted_at.is_null()),
    )
    .set((
        UpdateUserEntity {
            role: Some(body.role.as_str().into()),
            ..Default::default()
        },
        users::updated_at.eq(diesel::dsl::now),
    ))
    .returning(UserEntity::as_returning())
    .get_result(conn)
    .await?;

    tracing::info!("Admin #{} set role of user #{} to {}", admin.id, user.id, user.role);

    Ok(StdResponse {
        data: Some(user),
        message: Some("Changed role successfully"),
    })
}

#[derive(Deserialize, Validate, ToSchema, Debug)]
pub struct AdjustPointsReq {
    /// Signed change; the balance may not go below zero.
    #[validate(range(min = -1_000_000, max = 1_000_000))]
    pub delta: i32,
}

#[derive(Serialize, ToSchema, Debug)]
pub struct PointsBalance {
    pub user_id: i32,
    pub balance: i32,
}

/// Add or remove loyalty points by hand.
#[utoipa::path(
    post,
    path = "/{id}/loyalty",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    params(
        ("id" = i32, Path, description = "User ID")
    ),
    request_body = AdjustPointsReq,
    responses(
        (status = 200, description = "Adjusted points successfully", body = StdResponse<PointsBalance, String>),
        (status = 400, description = "Zero delta or the balance would go negative"),
        (status = 404, description = "User not found")
    )
)]
async fn adjust_points(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Json(body): Json<AdjustPointsReq>,
) -> Result<impl IntoResponse, AppError> {
    body.validate()?;
    if body.delta == 0 {
        return Err(AppError::BadRequest("delta must not be zero".into()));
    }

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let balance = conn
        .transaction(move |conn| {
            Box::pin(async move {
                let user_id: i32 = users::table
                    .find(id)
                    .filter(users::deleted_at.is_null())
                    .select(users::id)
                    .get_result(conn)
                    .await?;
                loyalty::record_points(conn, user_id, None, body.delta, loyalty::REASON_ADJUSTED)
                    .await
            })
        })
        .await?;

    tracing::info!(
        "Admin #{} adjusted points of user #{} by {}",
        admin.id,
        id,
        body.delta
    );

    Ok(StdResponse {
        data: Some(PointsBalance {
            user_id: id,
            balance,
        }),
        message: Some("Adjusted points successfully"),
    })
}

#[cfg(test)]
mod tests {
    use diesel::debug_query;

    use super::*;

    #[test]
    fn roles_map_to_stored_values() {
        assert_eq!(Role::Admin.as_str(), "admin");
        assert_eq!(Role::Customer.as_str(), "customer");
    }

    #[test]
    fn excludes_deleted_users() {
        let sql = debug_query::<Pg, _>(&filtered_users(&UserFilter::default())).to_string();
        assert!(sql.contains("\"users\".\"deleted_at\" IS NULL"));
    }

    #[test]
    fn bounds_adjustments() {
        let req = AdjustPointsReq { delta: 2_000_000 };
        assert!(req.validate().is_err());
    }
}
