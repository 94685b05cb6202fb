use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use diesel_async::{
    AsyncPgConnection,
    pooled_connection::{AsyncDieselConnectionManager, bb8::Pool},
};
use http_body_util::BodyExt;
use serde_json::Value;
use tastebud_foodservice::{
    build_app,
    platform::{
        app_state::AppState,
        config,
        middleware::SESSION_HEADER,
        signature::{self, SIGNATURE_HEADER},
    },
};
use tower::ServiceExt;

const WEBHOOK_SECRET: &str = "webhook-secret";

/// An app whose pool never connects; past the middleware every request ends in a 500.
fn app() -> Router {
    let config = config::load_from(|key| match key {
        "DATABASE_URL" => Some("postgres://127.0.0.1:1/unreachable".into()),
        "AUTH_JWT_SECRET" => Some("jwt-secret".into()),
        "AUTH_WEBHOOK_SECRET" => Some(WEBHOOK_SECRET.into()),
        _ => None,
    })
    .unwrap();

    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&config.database.url);
    let pool = Pool::builder()
        .connection_timeout(Duration::from_millis(200))
        .build_unchecked(manager);
    build_app(AppState::new(pool, config).unwrap()).unwrap()
}

async fn send(request: Request<Body>) -> (StatusCode, Value) {
    let response = app().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn health_is_ok() {
    let (status, body) = send(get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "ok");
}

#[tokio::test]
async fn serves_openapi_document() {
    let (status, body) = send(get("/api-docs/openapi.json")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["info"]["title"], "Tastebud FoodService API");

    let paths = body["paths"].as_object().unwrap();
    for path in [
        "/menu/items",
        "/cart/items",
        "/customers/orders/{id}/payment",
        "/admin/orders/{id}/status",
        "/webhooks/payments",
    ] {
        assert!(paths.contains_key(path), "missing {path}");
    }
    assert!(body["components"]["securitySchemes"]["bearerAuth"].is_object());
}

#[tokio::test]
async fn customer_routes_require_a_token() {
    let (status, _) = send(get("/customers/me")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_routes_require_a_token() {
    let (status, _) = send(get("/admin/dashboard")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn rejects_malformed_tokens_before_lookup() {
    let request = Request::builder()
        .uri("/admin/orders")
        .header(header::AUTHORIZATION, "Bearer not-a-jwt")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "Invalid or expired token");
}

#[tokio::test]
async fn cart_needs_a_token_or_session() {
    let (status, _) = send(get("/cart")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn cart_rejects_short_session_ids() {
    let request = Request::builder()
        .uri("/cart")
        .header(SESSION_HEADER, "abc")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn auth_webhook_rejects_bad_signatures() {
    let payload = r#"{"type":"user.deleted","data":{"id":"usr_1"}}"#;
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/auth")
        .header(header::CONTENT_TYPE, "application/json")
        .header(SIGNATURE_HEADER, "00".repeat(32))
        .body(Body::from(payload))
        .unwrap();
    let (status, _) = send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn auth_webhook_rejects_signed_garbage() {
    let payload = b"{\"type\":\"user.renamed\"}";
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/auth")
        .header(SIGNATURE_HEADER, signature::sign(WEBHOOK_SECRET, payload).unwrap())
        .body(Body::from(&payload[..]))
        .unwrap();
    let (status, _) = send(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn payment_webhook_unavailable_without_secret() {
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/payments")
        .body(Body::from("{}"))
        .unwrap();
    let (status, _) = send(request).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn anonymous_visitors_get_past_offer_browsing_auth() {
    let (status, _) = send(get("/offers")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let (status, _) = send(get("/offers/code/WELCOME10")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn browsing_offers_with_a_bad_token_is_rejected() {
    let request = Request::builder()
        .uri("/offers")
        .header(header::AUTHORIZATION, "Bearer not-a-jwt")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn offer_interactions_need_a_token_or_session() {
    let request = Request::builder()
        .method("POST")
        .uri("/offers/1/interactions")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"event":"view"}"#))
        .unwrap();
    let (status, _) = send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
