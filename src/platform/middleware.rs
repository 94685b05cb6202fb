//! Request authentication.
//!
//! Customers and admins carry a bearer JWT issued by the identity provider.
//! Storefront routes that also serve anonymous visitors accept an
//! `X-Session-Id` header instead.

use anyhow::Context;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
};
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::RunQueryDsl;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};

use crate::{
    models::UserEntity,
    platform::{app_error::AppError, app_state::AppState},
    schema::users,
};

pub const SESSION_HEADER: &str = "x-session-id";

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_CUSTOMER: &str = "customer";

/// Claims of an identity-provider token. `sub` is the provider's user id.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

/// The signed-in user, inserted as a request extension.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: i32,
    pub role: String,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == ROLE_ADMIN
    }
}

/// Who is looking at the storefront: a signed-in user or an anonymous session.
#[derive(Debug, Clone)]
pub enum Viewer {
    User(AuthUser),
    Session(String),
}

impl Viewer {
    pub fn user_id(&self) -> Option<i32> {
        match self {
            Viewer::User(user) => Some(user.id),
            Viewer::Session(_) => None,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Viewer::User(_) => None,
            Viewer::Session(session_id) => Some(session_id),
        }
    }
}

pub fn decode_token(token: &str, secret: &str) -> Result<Claims, AppError> {
    let validation = Validation::new(Algorithm::HS256);
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|err| {
        tracing::debug!("Rejected token: {}", err);
        AppError::Unauthorized("Invalid or expired token".into())
    })
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Accepts session ids of 8..=128 visible ASCII characters.
pub fn session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|id| (8..=128).contains(&id.len()))
        .filter(|id| id.chars().all(|c| c.is_ascii_graphic()))
        .map(str::to_owned)
}

async fn authenticate(state: &AppState, token: &str) -> Result<AuthUser, AppError> {
    let claims = decode_token(token, &state.config.auth.jwt_secret)?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let user: Option<UserEntity> = users::table
        .filter(users::auth_provider_id.eq(&claims.sub))
        .filter(users::deleted_at.is_null())
        .select(UserEntity::as_select())
        .first(conn)
        .await
        .optional()
        .context("Failed to load user")?;

    match user {
        Some(user) => Ok(AuthUser {
            id: user.id,
            role: user.role,
        }),
        None => Err(AppError::Unauthorized("Unknown user".into())),
    }
}

/// Requires a valid bearer token; inserts `AuthUser`.
pub async fn customers_authorization(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer_token(req.headers())
        .ok_or_else(|| AppError::Unauthorized("Missing bearer token".into()))?
        .to_owned();

    let user = authenticate(&state, &token).await?;
    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}

/// Requires a valid bearer token of an admin; inserts `AuthUser`.
pub async fn admins_authorization(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer_token(req.headers())
        .ok_or_else(|| AppError::Unauthorized("Missing bearer token".into()))?
        .to_owned();

    let user = authenticate(&state, &token).await?;
    if !user.is_admin() {
        return Err(AppError::ForbiddenResource("Admin access required".into()));
    }

    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}

/// `None` when the request carries neither a bearer token nor a session id.
///
/// A token that is present but invalid is rejected rather than downgraded to
/// an anonymous session.
async fn resolve_viewer(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Option<Viewer>, AppError> {
    match bearer_token(headers) {
        Some(token) => Ok(Some(Viewer::User(authenticate(state, token).await?))),
        None => Ok(session_id(headers).map(Viewer::Session)),
    }
}

/// Accepts either a bearer token or an `X-Session-Id`; inserts `Viewer`.
pub async fn viewer_identity(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(viewer) = resolve_viewer(&state, req.headers()).await? else {
        return Err(AppError::Unauthorized(
            "Sign in or provide an X-Session-Id header".into(),
        ));
    };

    req.extensions_mut().insert(viewer);
    Ok(next.run(req).await)
}

/// Like [`viewer_identity`] but lets anonymous requests through without a `Viewer`.
pub async fn optional_viewer(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    if let Some(viewer) = resolve_viewer(&state, req.headers()).await? {
        req.extensions_mut().insert(viewer);
    }
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use jsonwebtoken::{EncodingKey, Header, encode};

    use super::*;

    fn token(sub: &str, exp: usize, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &Claims {
                sub: sub.into(),
                exp,
            },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn in_one_hour() -> usize {
        (chrono::Utc::now().timestamp() + 3600) as usize
    }

    #[test]
    fn decodes_valid_token() {
        let claims = decode_token(&token("user_abc", in_one_hour(), "s3cret"), "s3cret").unwrap();
        assert_eq!(claims.sub, "user_abc");
    }

    #[test]
    fn rejects_wrong_secret_and_expired_tokens() {
        let err = decode_token(&token("user_abc", in_one_hour(), "s3cret"), "other").unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));

        let expired = token("user_abc", 1_000, "s3cret");
        assert!(decode_token(&expired, "s3cret").is_err());
    }

    #[test]
    fn extracts_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic xyz"));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn validates_session_ids() {
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_HEADER, HeaderValue::from_static("short"));
        assert_eq!(session_id(&headers), None);

        headers.insert(
            SESSION_HEADER,
            HeaderValue::from_static("7f9c2ba4-e88f-11eb-9a03-0242ac130003"),
        );
        assert_eq!(
            session_id(&headers).as_deref(),
            Some("7f9c2ba4-e88f-11eb-9a03-0242ac130003")
        );
    }

    #[test]
    fn viewer_accessors() {
        let user = Viewer::User(AuthUser {
            id: 7,
            role: ROLE_CUSTOMER.into(),
        });
        assert_eq!(user.user_id(), Some(7));
        assert_eq!(user.session_id(), None);

        let session = Viewer::Session("anon-session-1".into());
        assert_eq!(session.user_id(), None);
        assert_eq!(session.session_id(), Some("anon-session-1"));
    }
}
