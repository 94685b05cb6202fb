//! Signed callbacks from the identity provider and the payment gateway.
//!
//! Both verify an HMAC-SHA256 of the raw body before touching the database.

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper, upsert::excluded};
use diesel_async::{AsyncConnection, RunQueryDsl};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;

use crate::{
    models::{CreateUserEntity, OrderEntity, PaymentEntity, UserEntity},
    platform::{
        app_error::{AppError, StdResponse},
        app_state::AppState,
        signature::{self, SIGNATURE_HEADER},
    },
    schema::{orders, payments, users},
    services::{
        order_status::OrderStatus,
        orders::{PAYMENT_FAILED, PAYMENT_PAID, PAYMENT_PENDING, change_status},
    },
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/webhooks",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(auth_webhook))
            .routes(utoipa_axum::routes!(payments_webhook)),
    )
}

/// Checks the signature header and decodes the body.
fn verified_payload<T: DeserializeOwned>(
    secret: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<T, AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("Missing webhook signature".into()))?;

    if !signature::verify(secret, body, signature) {
        return Err(AppError::Unauthorized("Invalid webhook signature".into()));
    }

    serde_json::from_slice(body)
        .map_err(|err| AppError::BadRequest(format!("Malformed webhook payload: {err}")))
}

#[derive(Deserialize, ToSchema, Debug)]
pub struct ProviderUser {
    /// The provider's user id, matched against the token `sub`.
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub phone: Option<String>,
}

#[derive(Deserialize, ToSchema, Debug)]
pub struct DeletedUser {
    pub id: String,
}

#[derive(Deserialize, ToSchema, Debug)]
#[serde(tag = "type", content = "data")]
pub enum AuthEvent {
    #[serde(rename = "user.created")]
    Created(ProviderUser),
    #[serde(rename = "user.updated")]
    Updated(ProviderUser),
    #[serde(rename = "user.deleted")]
    Deleted(DeletedUser),
}

/// Keep local users in sync with the identity provider.
#[utoipa::path(
    post,
    path = "/auth",
    tags = ["Webhooks"],
    request_body = AuthEvent,
    responses(
        (status = 200, description = "Processed event successfully", body = StdResponse<String, String>),
        (status = 401, description = "Missing or invalid signature")
    )
)]
async fn auth_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let event: AuthEvent = verified_payload(&state.config.auth.webhook_secret, &headers, &body)?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    match event {
        AuthEvent::Created(user) | AuthEvent::Updated(user) => {
            let synced: UserEntity = diesel::insert_into(users::table)
                .values(CreateUserEntity {
                    auth_provider_id: user.id,
                    email: user.email,
                    name: user.name,
                    phone: user.phone,
                })
                .on_conflict(users::auth_provider_id)
                .do_update()
                .set((
                    users::email.eq(excluded(users::email)),
                    users::name.eq(excluded(users::name)),
                    users::deleted_at.eq(None::<DateTime<Utc>>),
                    users::updated_at.eq(diesel::dsl::now),
                ))
                .returning(UserEntity::as_returning())
                .get_result(conn)
                .await
                .context("Failed to sync user")?;
            tracing::info!("Synced user #{} from identity provider", synced.id);
        }
        AuthEvent::Deleted(user) => {
            let deleted = diesel::update(
                users::table
                    .filter(users::auth_provider_id.eq(&user.id))
                    .filter(users::deleted_at.is_null()),
            )
            .set((
                users::deleted_at.eq(diesel::dsl::now),
                users::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)
            .await
            .context("Failed to delete user")?;
            tracing::info!("Soft-deleted {} user(s) for {}", deleted, user.id);
        }
    }

    Ok(StdResponse::<String, _> {
        data: None,
        message: Some("Processed event successfully"),
    })
}

#[derive(Deserialize, ToSchema, Debug)]
pub struct PaymentEventData {
    /// Payment intent id returned when the payment was created.
    pub intent_id: String,
    pub failure_reason: Option<String>,
}

#[derive(Deserialize, ToSchema, Debug)]
#[serde(tag = "type", content = "data")]
pub enum PaymentEvent {
    #[serde(rename = "payment.succeeded")]
    Succeeded(PaymentEventData),
    #[serde(rename = "payment.failed")]
    Failed(PaymentEventData),
}

#[derive(Serialize, ToSchema, Debug)]
pub struct PaymentWebhookRes {
    pub payment: PaymentEntity,
    pub order: Option<OrderEntity>,
}

/// Settle a payment reported by the gateway. A successful payment confirms its order.
#[utoipa::path(
    post,
    path = "/payments",
    tags = ["Webhooks"],
    request_body = PaymentEvent,
    responses(
        (status = 200, description = "Processed payment successfully", body = StdResponse<PaymentWebhookRes, String>),
        (status = 401, description = "Missing or invalid signature"),
        (status = 404, description = "Unknown payment"),
        (status = 503, description = "Payment webhooks are not configured")
    )
)]
async fn payments_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let secret = state
        .config
        .payments
        .webhook_secret
        .as_deref()
        .ok_or_else(|| AppError::ServiceUnreachable("PaymentGateway".into()))?;
    let event: PaymentEvent = verified_payload(secret, &headers, &body)?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let points_per_unit = state.config.ordering.loyalty_points_per_unit;

    let result = conn
        .transaction(move |conn| {
            Box::pin(async move {
                let (data, status) = match &event {
                    PaymentEvent::Succeeded(data) => (data, PAYMENT_PAID),
                    PaymentEvent::Failed(data) => (data, PAYMENT_FAILED),
                };

                let updated: Option<PaymentEntity> = diesel::update(
                    payments::table
                        .filter(payments::provider_ref.eq(&data.intent_id))
                        .filter(payments::status.eq(PAYMENT_PENDING)),
                )
                .set((
                    payments::status.eq(status),
                    payments::failure_reason.eq(&data.failure_reason),
                    payments::updated_at.eq(diesel::dsl::now),
                ))
                .returning(PaymentEntity::as_returning())
                .get_result(conn)
                .await
                .optional()
                .context("Failed to update payment")?;

                // Gateways redeliver; an already settled payment is acknowledged as is.
                let Some(payment) = updated else {
                    let payment: PaymentEntity = payments::table
                        .filter(payments::provider_ref.eq(&data.intent_id))
                        .select(PaymentEntity::as_select())
                        .get_result(conn)
                        .await?;
                    return Ok(PaymentWebhookRes {
                        payment,
                        order: None,
                    });
                };

                let order = match event {
                    PaymentEvent::Succeeded(_) => {
                        let status: String = orders::table
                            .find(payment.order_id)
                            .select(orders::status)
                            .get_result(conn)
                            .await?;
                        if status == OrderStatus::Pending.as_str() {
                            Some(
                                change_status(
                                    conn,
                                    payment.order_id,
                                    OrderStatus::Confirmed,
                                    points_per_unit,
                                )
                                .await?,
                            )
                        } else {
                            tracing::warn!(
                                "Payment {} succeeded for order #{} in status {}",
                                payment.id,
                                payment.order_id,
                                status
                            );
                            None
                        }
                    }
                    PaymentEvent::Failed(_) => {
                        tracing::info!(
                            "Payment {} for order #{} failed: {}",
                            payment.id,
                            payment.order_id,
                            payment.failure_reason.as_deref().unwrap_or("unknown reason")
                        );
                        None
                    }
                };

                Ok::<PaymentWebhookRes, AppError>(PaymentWebhookRes { payment, order })
            })
        })
        .await?;

    Ok(StdResponse {
        data: Some(result),
        message: Some("Processed payment successfully"),
    })
}
