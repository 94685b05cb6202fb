use anyhow::Context;
use axum::{Extension, Json, extract::State, response::IntoResponse};
use diesel::{ExpressionMethods, QueryDsl, SelectableHelper};
use diesel_async::RunQueryDsl;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;
use validator::{Validate, ValidationError};

use crate::{
    models::{LoyaltyTransactionEntity, UpdateUserEntity, UserEntity},
    platform::{
        app_error::{AppError, StdResponse},
        app_state::AppState,
        middleware::{self, AuthUser},
    },
    schema::{loyalty_transactions, users},
    services::loyalty,
};

const HISTORY_LIMIT: i64 = 50;

pub fn routes_with_openapi(state: &AppState) -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/customers/me",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(get_me, update_me))
            .routes(utoipa_axum::routes!(get_loyalty))
            .route_layer(axum::middleware::from_fn_with_state(
                state.clone(),
                middleware::customers_authorization,
            )),
    )
}

/// E.164-ish: an optional `+` followed by 8 to 15 digits.
pub fn validate_phone(phone: &str) -> Result<(), ValidationError> {
    let digits = phone.strip_prefix('+').unwrap_or(phone);
    if (8..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit()) {
        Ok(())
    } else {
        Err(ValidationError::new("phone"))
    }
}

/// Fetch the authenticated user's profile.
#[utoipa::path(
    get,
    path = "/",
    tags = ["Profile"],
    security(("bearerAuth" = [])),
    responses(
        (status = 200, description = "Get profile successfully", body = StdResponse<UserEntity, String>)
    )
)]
async fn get_me(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let me: UserEntity = users::table
        .find(user.id)
        .select(UserEntity::as_select())
        .get_result(conn)
        .await?;

    Ok(StdResponse {
        data: Some(me),
        message: Some("Get profile successfully"),
    })
}

#[derive(Deserialize, Validate, ToSchema, Debug)]
pub struct UpdateMeReq {
    #[validate(length(min = 1, max = 100))]
    pub name: Option<String>,
    /// Changing the number clears its verified flag.
    #[validate(custom(function = "validate_phone"))]
    pub phone: Option<String>,
}

/// Update the authenticated user's name or phone number.
#[utoipa::path(
    patch,
    path = "/",
    tags = ["Profile"],
    security(("bearerAuth" = [])),
    request_body = UpdateMeReq,
    responses(
        (status = 200, description = "Updated profile successfully", body = StdResponse<UserEntity, String>),
        (status = 400, description = "Invalid fields or nothing to update")
    )
)]
async fn update_me(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<UpdateMeReq>,
) -> Result<impl IntoResponse, AppError> {
    body.validate()?;
    if body.name.is_none() && body.phone.is_none() {
        return Err(AppError::BadRequest("Nothing to update".into()));
    }

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let current_phone: Option<String> = users::table
        .find(user.id)
        .select(users::phone)
        .get_result(conn)
        .await?;

    let phone_changed = body.phone.is_some() && body.phone != current_phone;

    let me: UserEntity = diesel::update(users::table.find(user.id))
        .set((
            UpdateUserEntity {
                name: body.name.map(|name| name.trim().to_owned()),
                phone: body.phone,
                phone_verified: phone_changed.then_some(false),
                ..Default::default()
            },
            users::updated_at.eq(diesel::dsl::now),
        ))
        .returning(UserEntity::as_returning())
        .get_result(conn)
        .await?;

    Ok(StdResponse {
        data: Some(me),
        message: Some("Updated profile successfully"),
    })
}

#[derive(Serialize, ToSchema, Debug)]
pub struct LoyaltySummary {
    pub balance: i32,
    /// What the current balance is worth at checkout.
    pub redeemable_discount: Decimal,
    pub points_per_block: i32,
    pub history: Vec<LoyaltyTransactionEntity>,
}

/// Fetch the loyalty balance and the most recent ledger entries.
#[utoipa::path(
    get,
    path = "/loyalty",
    tags = ["Profile"],
    security(("bearerAuth" = [])),
    responses(
        (status = 200, description = "Get loyalty successfully", body = StdResponse<LoyaltySummary, String>)
    )
)]
async fn get_loyalty(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let balance: i32 = users::table
        .find(user.id)
        .select(users::loyalty_points)
        .get_result(conn)
        .await?;

    let history: Vec<LoyaltyTransactionEntity> = loyalty_transactions::table
        .filter(loyalty_transactions::user_id.eq(user.id))
        .order_by(loyalty_transactions::id.desc())
        .limit(HISTORY_LIMIT)
        .select(LoyaltyTransactionEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to get loyalty history")?;

    Ok(StdResponse {
        data: Some(LoyaltySummary {
            balance,
            redeemable_discount: loyalty::discount_for_points(balance),
            points_per_block: loyalty::POINTS_PER_BLOCK,
            history,
        }),
        message: Some("Get loyalty successfully"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plausible_phone_numbers() {
        assert!(validate_phone("+919876543210").is_ok());
        assert!(validate_phone("9876543210").is_ok());
        assert!(validate_phone("+91 98765").is_err());
        assert!(validate_phone("12345").is_err());
        assert!(validate_phone("+1234567890123456").is_err());
    }

    #[test]
    fn rejects_blank_names() {
        let req = UpdateMeReq {
            name: Some(String::new()),
            phone: None,
        };
        assert!(req.validate().unwrap_err().field_errors().contains_key("name"));
    }
}
