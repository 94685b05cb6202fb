use std::collections::HashSet;

use anyhow::Context;
use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use chrono::Utc;
use diesel::{ExpressionMethods, QueryDsl, SelectableHelper};
use diesel_async::RunQueryDsl;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use utoipa_axum::router::OpenApiRouter;

use crate::{
    models::{CreateOfferInteractionEntity, OfferInteractionEntity, OfferEntity},
    platform::{
        app_error::{AppError, StdResponse},
        app_state::AppState,
        middleware::{self, Viewer},
    },
    schema::{offer_interactions, offers},
    services::offers::{
        self as offer_rules, InteractionEvent, OfferKind, audience_profile,
        find_by_code,
    },
};

pub fn routes_with_openapi(state: &AppState) -> OpenApiRouter<AppState> {
    let browse = OpenApiRouter::new()
        .routes(utoipa_axum::routes!(list_active_offers))
        .routes(utoipa_axum::routes!(get_coupon))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::optional_viewer,
        ));

    let interactions = OpenApiRouter::new()
        .routes(utoipa_axum::routes!(record_interaction))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::viewer_identity,
        ));

    OpenApiRouter::new().nest("/offers", browse.merge(interactions))
}

#[derive(Deserialize, IntoParams, Debug, Default)]
#[into_params(parameter_in = Query)]
pub struct OfferFilter {
    pub kind: Option<OfferKind>,
}

/// Live offers targeted at the viewer, highest priority first.
#[utoipa::path(
    get,
    path = "/",
    tags = ["Offers"],
    security(("bearerAuth" = []), ("sessionId" = [])),
    params(OfferFilter),
    responses(
        (status = 200, description = "Get offers successfully", body = StdResponse<Vec<OfferEntity>, String>)
    )
)]
async fn list_active_offers(
    State(state): State<AppState>,
    viewer: Option<Extension<Viewer>>,
    Query(filter): Query<OfferFilter>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let profile = audience_profile(conn, viewer.as_deref()).await?;
    let now = Utc::now();

    let mut query = offers::table
        .filter(offers::is_active.eq(true))
        .filter(offers::starts_at.le(now))
        .filter(offers::ends_at.gt(now))
        .filter(offers::target_audience.eq_any(profile.audiences()))
        .order_by((offers::priority.desc(), offers::id.desc()))
        .select(OfferEntity::as_select())
        .into_boxed();

    if let Some(kind) = filter.kind {
        query = query.filter(offers::kind.eq(kind.as_str()));
    }

    let candidates: Vec<OfferEntity> = query
        .load(conn)
        .await
        .context("Failed to get offers")?;

    let dismissed: HashSet<i32> = match viewer.as_deref() {
        Some(viewer) => {
            let mut query = offer_interactions::table
                .filter(offer_interactions::event.eq(InteractionEvent::Dismiss.as_str()))
                .select(offer_interactions::offer_id)
                .into_boxed();
            query = match viewer {
                Viewer::User(user) => query.filter(offer_interactions::user_id.eq(user.id)),
                Viewer::Session(session_id) => {
                    query.filter(offer_interactions::session_id.eq(session_id.clone()))
                }
            };
            query
                .load::<i32>(conn)
                .await
                .context("Failed to get dismissed offers")?
                .into_iter()
                .collect()
        }
        // Anonymous visitors have nothing to dismiss against.
        None => HashSet::new(),
    };

    let visible: Vec<OfferEntity> = candidates
        .into_iter()
        .filter(|offer| !dismissed.contains(&offer.id))
        .filter(|offer| offer_rules::is_visible_to(offer, &profile, now))
        .collect();

    Ok(StdResponse {
        data: Some(visible),
        message: Some("Get offers successfully"),
    })
}

#[derive(Deserialize, IntoParams, Debug)]
#[into_params(parameter_in = Query)]
pub struct CouponQuery {
    /// Cart subtotal to preview the discount against.
    pub subtotal: Option<Decimal>,
}

#[derive(Serialize, ToSchema, Debug)]
pub struct CouponPreview {
    pub offer: OfferEntity,
    pub discount: Option<Decimal>,
}

/// Look up a coupon code entered at checkout.
#[utoipa::path(
    get,
    path = "/code/{code}",
    tags = ["Offers"],
    security(("bearerAuth" = []), ("sessionId" = [])),
    params(
        ("code" = String, Path, description = "Coupon code"),
        CouponQuery
    ),
    responses(
        (status = 200, description = "Get coupon successfully", body = StdResponse<CouponPreview, String>),
        (status = 400, description = "Order below the coupon minimum"),
        (status = 404, description = "No live coupon for this viewer")
    )
)]
async fn get_coupon(
    Path(code): Path<String>,
    State(state): State<AppState>,
    viewer: Option<Extension<Viewer>>,
    Query(query): Query<CouponQuery>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let offer = find_by_code(conn, &code).await?.ok_or(AppError::NotFound)?;
    let profile = audience_profile(conn, viewer.as_deref()).await?;

    if !offer_rules::is_visible_to(&offer, &profile, Utc::now()) {
        return Err(AppError::NotFound);
    }

    let discount = match query.subtotal {
        Some(subtotal) => Some(offer_rules::discount_for(&offer, subtotal)?),
        None => None,
    };

    Ok(StdResponse {
        data: Some(CouponPreview { offer, discount }),
        message: Some("Get coupon successfully"),
    })
}

#[derive(Deserialize, ToSchema, Debug)]
pub struct RecordInteractionReq {
    pub event: InteractionEvent,
}

/// Record that the viewer saw, clicked or dismissed an offer.
#[utoipa::path(
    post,
    path = "/{id}/interactions",
    tags = ["Offers"],
    security(("bearerAuth" = []), ("sessionId" = [])),
    params(
        ("id" = i32, Path, description = "Offer ID")
    ),
    request_body = RecordInteractionReq,
    responses(
        (status = 200, description = "Recorded interaction successfully", body = StdResponse<OfferInteractionEntity, String>),
        (status = 404, description = "Offer not found")
    )
)]
async fn record_interaction(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Extension(viewer): Extension<Viewer>,
    Json(body): Json<RecordInteractionReq>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let offer_id: i32 = offers::table
        .find(id)
        .select(offers::id)
        .get_result(conn)
        .await?;

    let interaction: OfferInteractionEntity = diesel::insert_into(offer_interactions::table)
        .values(CreateOfferInteractionEntity {
            offer_id,
            user_id: viewer.user_id(),
            session_id: viewer.session_id().map(str::to_owned),
            event: body.event.as_str().to_owned(),
        })
        .returning(OfferInteractionEntity::as_returning())
        .get_result(conn)
        .await
        .context("Failed to record offer interaction")?;

    Ok(StdResponse {
        data: Some(interaction),
        message: Some("Recorded interaction successfully"),
    })
}
