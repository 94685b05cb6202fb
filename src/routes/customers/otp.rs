use anyhow::Context;
use axum::{Extension, Json, extract::State, response::IntoResponse};
use chrono::{Duration, Utc};
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::{AsyncConnection, RunQueryDsl};
use rand::Rng;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;
use validator::Validate;

use crate::{
    api::notifications::{self, Channel},
    models::{CreateOtpCodeEntity, OtpCodeEntity, UserEntity},
    platform::{
        app_error::{AppError, StdResponse},
        app_state::AppState,
        middleware::{self, AuthUser},
        signature::sha256_hex,
    },
    routes::customers::profile::validate_phone,
    schema::{otp_codes, users},
};

pub const CODE_TTL_MINUTES: i64 = 10;
pub const RESEND_COOLDOWN_SECS: i64 = 60;
pub const MAX_ATTEMPTS: i32 = 5;

pub fn routes_with_openapi(state: &AppState) -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/customers/otp",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(request_otp))
            .routes(utoipa_axum::routes!(verify_otp))
            .route_layer(axum::middleware::from_fn_with_state(
                state.clone(),
                middleware::customers_authorization,
            )),
    )
}

fn generate_code() -> String {
    format!("{:06}", rand::thread_rng().gen_range(0..1_000_000))
}

/// Codes are stored hashed together with the phone they were sent to.
fn hash_code(phone: &str, code: &str) -> String {
    sha256_hex(&format!("{phone}:{code}"))
}

/// `claimed` is the attempt count after a successful claim, `None` once the cap was reached.
fn check_attempt(claimed: Option<i32>) -> Result<i32, AppError> {
    claimed.ok_or_else(|| AppError::TooManyRequests("Too many attempts, request a new code".into()))
}

#[derive(Deserialize, Validate, ToSchema, Debug)]
pub struct RequestOtpReq {
    #[validate(custom(function = "validate_phone"))]
    pub phone: String,
}

#[derive(Serialize, ToSchema, Debug)]
pub struct OtpSentRes {
    pub expires_in_secs: i64,
}

/// Send a one-time code to a phone number.
#[utoipa::path(
    post,
    path = "/request",
    tags = ["Profile"],
    security(("bearerAuth" = [])),
    request_body = RequestOtpReq,
    responses(
        (status = 200, description = "Sent code successfully", body = StdResponse<OtpSentRes, String>),
        (status = 429, description = "A code was sent less than a minute ago")
    )
)]
async fn request_otp(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<RequestOtpReq>,
) -> Result<impl IntoResponse, AppError> {
    body.validate()?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let now = Utc::now();
    let recent: i64 = otp_codes::table
        .filter(otp_codes::phone.eq(&body.phone))
        .filter(otp_codes::created_at.gt(now - Duration::seconds(RESEND_COOLDOWN_SECS)))
        .count()
        .get_result(conn)
        .await
        .context("Failed to check recent codes")?;
    if recent > 0 {
        return Err(AppError::TooManyRequests(
            "Please wait a minute before requesting another code".into(),
        ));
    }

    let code = generate_code();
    diesel::insert_into(otp_codes::table)
        .values(CreateOtpCodeEntity {
            user_id: user.id,
            phone: body.phone.clone(),
            code_hash: hash_code(&body.phone, &code),
            expires_at: now + Duration::minutes(CODE_TTL_MINUTES),
        })
        .execute(conn)
        .await
        .context("Failed to store code")?;

    notifications::send_message(
        &state.http_client,
        &state.config.notifications,
        Channel::Sms,
        &body.phone,
        &format!("Your Tastebud verification code is {code}. It expires in {CODE_TTL_MINUTES} minutes."),
    )
    .await?;

    Ok(StdResponse {
        data: Some(OtpSentRes {
            expires_in_secs: CODE_TTL_MINUTES * 60,
        }),
        message: Some("Sent code successfully"),
    })
}

#[derive(Deserialize, Validate, ToSchema, Debug)]
pub struct VerifyOtpReq {
    #[validate(custom(function = "validate_phone"))]
    pub phone: String,
    #[validate(length(equal = 6))]
    pub code: String,
}

/// Check a one-time code and mark the phone number as verified.
#[utoipa::path(
    post,
    path = "/verify",
    tags = ["Profile"],
    security(("bearerAuth" = [])),
    request_body = VerifyOtpReq,
    responses(
        (status = 200, description = "Verified phone successfully", body = StdResponse<UserEntity, String>),
        (status = 400, description = "Wrong, expired or missing code"),
        (status = 429, description = "Too many wrong attempts")
    )
)]
async fn verify_otp(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<VerifyOtpReq>,
) -> Result<impl IntoResponse, AppError> {
    body.validate()?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let otp: OtpCodeEntity = otp_codes::table
        .filter(otp_codes::user_id.eq(user.id))
        .filter(otp_codes::phone.eq(&body.phone))
        .filter(otp_codes::consumed_at.is_null())
        .filter(otp_codes::expires_at.gt(Utc::now()))
        .order_by(otp_codes::id.desc())
        .select(OtpCodeEntity::as_select())
        .first(conn)
        .await
        .optional()
        .context("Failed to get code")?
        .ok_or_else(|| AppError::BadRequest("No active code for this number".into()))?;

    // The cap is checked by the same statement that claims the attempt.
    let claimed: Option<i32> = diesel::update(
        otp_codes::table
            .find(otp.id)
            .filter(otp_codes::attempts.lt(MAX_ATTEMPTS)),
    )
    .set(otp_codes::attempts.eq(otp_codes::attempts + 1))
    .returning(otp_codes::attempts)
    .get_result(conn)
    .await
    .optional()
    .context("Failed to count attempt")?;
    check_attempt(claimed)?;

    if otp.code_hash != hash_code(&body.phone, &body.code) {
        return Err(AppError::BadRequest("Incorrect code".into()));
    }

    let me = conn
        .transaction(move |conn| {
            Box::pin(async move {
                diesel::update(otp_codes::table.find(otp.id))
                    .set(otp_codes::consumed_at.eq(diesel::dsl::now))
                    .execute(conn)
                    .await
                    .context("Failed to consume code")?;

                let me: UserEntity = diesel::update(users::table.find(user.id))
                    .set((
                        users::phone.eq(&body.phone),
                        users::phone_verified.eq(true),
                        users::updated_at.eq(diesel::dsl::now),
                    ))
                    .returning(UserEntity::as_returning())
                    .get_result(conn)
                    .await?;

                Ok::<UserEntity, AppError>(me)
            })
        })
        .await?;

    tracing::info!("User #{} verified their phone number", me.id);

    Ok(StdResponse {
        data: Some(me),
        message: Some("Verified phone successfully"),
    })
}
