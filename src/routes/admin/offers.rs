use std::collections::HashMap;

use anyhow::Context;
use axum::{
    Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use diesel::{ExpressionMethods, QueryDsl, SelectableHelper, dsl::count_star, pg::Pg};
use diesel_async::RunQueryDsl;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use utoipa_axum::router::OpenApiRouter;
use validator::Validate;

use crate::{
    models::{CreateOfferEntity, OfferEntity, UpdateOfferEntity},
    platform::{
        app_error::{AppError, StdResponse},
        app_state::AppState,
        pagination::{PageParams, Paginated},
    },
    schema::{offer_interactions, offers},
    services::offers::{DiscountType, InteractionEvent, OfferKind, TargetAudience, normalize_code},
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/offers",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(list_offers, create_offer))
            .routes(utoipa_axum::routes!(offer_stats))
            .routes(utoipa_axum::routes!(get_offer, update_offer, delete_offer)),
    )
}

/// The cross-field rules an offer has to satisfy after any change.
struct OfferRules<'a> {
    kind: &'a str,
    code: Option<&'a str>,
    discount_type: &'a str,
    discount_value: Decimal,
    max_discount: Option<Decimal>,
    min_order_amount: Decimal,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
}

impl OfferRules<'_> {
    fn check(&self) -> Result<(), AppError> {
        let problem = if self.ends_at <= self.starts_at {
            Some("ends_at must be after starts_at")
        } else if self.kind == OfferKind::Coupon.as_str() && self.code.is_none() {
            Some("Coupons need a code")
        } else if self.discount_value.is_sign_negative() {
            Some("discount_value cannot be negative")
        } else if self.discount_type == DiscountType::Percentage.as_str()
            && self.discount_value > Decimal::ONE_HUNDRED
        {
            Some("A percentage discount cannot exceed 100")
        } else if self.max_discount.is_some_and(|cap| cap.is_sign_negative()) {
            Some("max_discount cannot be negative")
        } else if self.min_order_amount.is_sign_negative() {
            Some("min_order_amount cannot be negative")
        } else {
            None
        };

        match problem {
            Some(problem) => Err(AppError::BadRequest(problem.into())),
            None => Ok(()),
        }
    }
}

#[derive(Deserialize, IntoParams, Debug, Default)]
#[into_params(parameter_in = Query)]
pub struct AdminOfferFilter {
    pub kind: Option<OfferKind>,
    pub is_active: Option<bool>,
}

/// Fetch offers, highest priority first.
#[utoipa::path(
    get,
    path = "/",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    params(AdminOfferFilter, PageParams),
    responses(
        (status = 200, description = "Get offers successfully", body = StdResponse<Paginated<OfferEntity>, String>)
    )
)]
async fn list_offers(
    State(state): State<AppState>,
    Query(filter): Query<AdminOfferFilter>,
    Query(page): Query<PageParams>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let filtered = || -> offers::BoxedQuery<'static, Pg> {
        let mut query = offers::table.into_boxed();
        if let Some(kind) = filter.kind {
            query = query.filter(offers::kind.eq(kind.as_str()));
        }
        if let Some(is_active) = filter.is_active {
            query = query.filter(offers::is_active.eq(is_active));
        }
        query
    };

    let total: i64 = filtered()
        .count()
        .get_result(conn)
        .await
        .context("Failed to count offers")?;

    let items: Vec<OfferEntity> = filtered()
        .order_by((offers::priority.desc(), offers::id.desc()))
        .limit(page.per_page())
        .offset(page.offset())
        .select(OfferEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to get offers")?;

    Ok(StdResponse {
        data: Some(Paginated::new(items, page, total)),
        message: Some("Get offers successfully"),
    })
}

/// Fetch one offer.
#[utoipa::path(
    get,
    path = "/{id}",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    params(
        ("id" = i32, Path, description = "Offer ID")
    ),
    responses(
        (status = 200, description = "Get offer successfully", body = StdResponse<OfferEntity, String>),
        (status = 404, description = "Offer not found")
    )
)]
async fn get_offer(
    Path(id): Path<i32>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let offer: OfferEntity = offers::table
        .find(id)
        .select(OfferEntity::as_select())
        .get_result(conn)
        .await?;

    Ok(StdResponse {
        data: Some(offer),
        message: Some("Get offer successfully"),
    })
}

#[derive(Deserialize, Validate, ToSchema, Debug)]
pub struct CreateOfferReq {
    #[validate(length(min = 1, max = 128))]
    pub title: String,
    #[validate(length(max = 2000))]
    pub description: Option<String>,
    #[validate(url)]
    pub image_url: Option<String>,
    pub kind: OfferKind,
    #[validate(length(min = 3, max = 32))]
    pub code: Option<String>,
    pub discount_type: DiscountType,
    pub discount_value: Decimal,
    pub max_discount: Option<Decimal>,
    #[serde(default)]
    pub min_order_amount: Decimal,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub target_audience: TargetAudience,
    #[validate(range(min = 1))]
    pub usage_limit: Option<i32>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub priority: i32,
}

fn default_active() -> bool {
    true
}

/// Create an offer.
#[utoipa::path(
    post,
    path = "/",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    request_body = CreateOfferReq,
    responses(
        (status = 200, description = "Created offer successfully", body = StdResponse<OfferEntity, String>),
        (status = 400, description = "Inconsistent offer fields"),
        (status = 409, description = "Coupon code already in use")
    )
)]
async fn create_offer(
    State(state): State<AppState>,
    Json(body): Json<CreateOfferReq>,
) -> Result<impl IntoResponse, AppError> {
    body.validate()?;
    let code = body.code.as_deref().map(normalize_code);

    OfferRules {
        kind: body.kind.as_str(),
        code: code.as_deref(),
        discount_type: body.discount_type.as_str(),
        discount_value: body.discount_value,
        max_discount: body.max_discount,
        min_order_amount: body.min_order_amount,
        starts_at: body.starts_at,
        ends_at: body.ends_at,
    }
    .check()?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let offer: OfferEntity = diesel::insert_into(offers::table)
        .values(CreateOfferEntity {
            title: body.title,
            description: body.description,
            image_url: body.image_url,
            kind: body.kind.as_str().into(),
            code,
            discount_type: body.discount_type.as_str().into(),
            discount_value: body.discount_value,
            max_discount: body.max_discount,
            min_order_amount: body.min_order_amount,
            starts_at: body.starts_at,
            ends_at: body.ends_at,
            target_audience: body.target_audience.as_str().into(),
            usage_limit: body.usage_limit,
            is_active: body.is_active,
            priority: body.priority,
        })
        .returning(OfferEntity::as_returning())
        .get_result(conn)
        .await?;

    tracing::info!("Created offer #{} {}", offer.id, offer.title);

    Ok(StdResponse {
        data: Some(offer),
        message: Some("Created offer successfully"),
    })
}

#[derive(Deserialize, Validate, ToSchema, Debug, Default)]
pub struct UpdateOfferReq {
    #[validate(length(min = 1, max = 128))]
    pub title: Option<String>,
    #[validate(length(max = 2000))]
    pub description: Option<String>,
    #[validate(url)]
    pub image_url: Option<String>,
    pub kind: Option<OfferKind>,
    #[validate(length(min = 3, max = 32))]
    pub code: Option<String>,
    pub discount_type: Option<DiscountType>,
    pub discount_value: Option<Decimal>,
    pub max_discount: Option<Decimal>,
    pub min_order_amount: Option<Decimal>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub target_audience: Option<TargetAudience>,
    #[validate(range(min = 1))]
    pub usage_limit: Option<i32>,
    pub is_active: Option<bool>,
    pub priority: Option<i32>,
}

/// Update an offer. The merged result must still be a consistent offer.
#[utoipa::path(
    patch,
    path = "/{id}",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    params(
        ("id" = i32, Path, description = "Offer ID")
    ),
    request_body = UpdateOfferReq,
    responses(
        (status = 200, description = "Updated offer successfully", body = StdResponse<OfferEntity, String>),
        (status = 400, description = "Inconsistent offer fields"),
        (status = 404, description = "Offer not found")
    )
)]
async fn update_offer(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Json(body): Json<UpdateOfferReq>,
) -> Result<impl IntoResponse, AppError> {
    body.validate()?;
    let code = body.code.as_deref().map(normalize_code);

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let current: OfferEntity = offers::table
        .find(id)
        .select(OfferEntity::as_select())
        .get_result(conn)
        .await?;

    OfferRules {
        kind: body.kind.map_or(current.kind.as_str(), |kind| kind.as_str()),
        code: code.as_deref().or(current.code.as_deref()),
        discount_type: body
            .discount_type
            .map_or(current.discount_type.as_str(), |kind| kind.as_str()),
        discount_value: body.discount_value.unwrap_or(current.discount_value),
        max_discount: body.max_discount.or(current.max_discount),
        min_order_amount: body.min_order_amount.unwrap_or(current.min_order_amount),
        starts_at: body.starts_at.unwrap_or(current.starts_at),
        ends_at: body.ends_at.unwrap_or(current.ends_at),
    }
    .check()?;

    let offer: OfferEntity = diesel::update(offers::table.find(id))
        .set((
            UpdateOfferEntity {
                title: body.title,
                description: body.description,
                image_url: body.image_url,
                kind: body.kind.map(|kind| kind.as_str().into()),
                code,
                discount_type: body.discount_type.map(|kind| kind.as_str().into()),
                discount_value: body.discount_value,
                max_discount: body.max_discount,
                min_order_amount: body.min_order_amount,
                starts_at: body.starts_at,
                ends_at: body.ends_at,
                target_audience: body.target_audience.map(|audience| audience.as_str().into()),
                usage_limit: body.usage_limit,
                is_active: body.is_active,
                priority: body.priority,
            },
            offers::updated_at.eq(diesel::dsl::now),
        ))
        .returning(OfferEntity::as_returning())
        .get_result(conn)
        .await?;

    Ok(StdResponse {
        data: Some(offer),
        message: Some("Updated offer successfully"),
    })
}

/// Delete an offer. Orders that used it keep their discount.
#[utoipa::path(
    delete,
    path = "/{id}",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    params(
        ("id" = i32, Path, description = "Offer ID")
    ),
    responses(
        (status = 200, description = "Deleted offer successfully", body = StdResponse<OfferEntity, String>),
        (status = 404, description = "Offer not found")
    )
)]
async fn delete_offer(
    Path(id): Path<i32>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let offer: OfferEntity = diesel::delete(offers::table.find(id))
        .returning(OfferEntity::as_returning())
        .get_result(conn)
        .await?;

    Ok(StdResponse {
        data: Some(offer),
        message: Some("Deleted offer successfully"),
    })
}

#[derive(Serialize, ToSchema, Debug, Clone, PartialEq, Eq)]
pub struct OfferStats {
    pub offer_id: i32,
    pub title: String,
    pub views: i64,
    pub clicks: i64,
    pub dismissals: i64,
    pub used_count: i32,
}

fn tally(
    offers: Vec<(i32, String, i32)>,
    counts: Vec<(i32, String, i64)>,
) -> Vec<OfferStats> {
    let mut by_offer: HashMap<i32, HashMap<String, i64>> = HashMap::new();
    for (offer_id, event, count) in counts {
        by_offer.entry(offer_id).or_default().insert(event, count);
    }

    offers
        .into_iter()
        .map(|(offer_id, title, used_count)| {
            let events = by_offer.remove(&offer_id).unwrap_or_default();
            let count = |event: InteractionEvent| events.get(event.as_str()).copied().unwrap_or(0);
            OfferStats {
                offer_id,
                title,
                views: count(InteractionEvent::View),
                clicks: count(InteractionEvent::Click),
                dismissals: count(InteractionEvent::Dismiss),
                used_count,
            }
        })
        .collect()
}

/// Views, clicks, dismissals and redemptions per offer.
#[utoipa::path(
    get,
    path = "/stats",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    responses(
        (status = 200, description = "Get offer stats successfully", body = StdResponse<Vec<OfferStats>, String>)
    )
)]
async fn offer_stats(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let all_offers: Vec<(i32, String, i32)> = offers::table
        .order_by(offers::id.asc())
        .select((offers::id, offers::title, offers::used_count))
        .load(conn)
        .await
        .context("Failed to get offers")?;

    let counts: Vec<(i32, String, i64)> = offer_interactions::table
        .group_by((offer_interactions::offer_id, offer_interactions::event))
        .select((
            offer_interactions::offer_id,
            offer_interactions::event,
            count_star(),
        ))
        .load(conn)
        .await
        .context("Failed to count offer interactions")?;

    Ok(StdResponse {
        data: Some(tally(all_offers, counts)),
        message: Some("Get offer stats successfully"),
    })
}
