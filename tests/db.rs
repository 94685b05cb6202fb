//! Runs against a real Postgres when `TEST_DATABASE_URL` is set; otherwise every test returns early.

use std::sync::OnceLock;

use axum::{
    body::Body,
    http::{Request, StatusCode, header},
};
use chrono::{Duration, Utc};
use diesel::{Connection, ExpressionMethods, PgConnection, QueryDsl, SelectableHelper};
use diesel_async::{
    AsyncConnection, AsyncPgConnection, RunQueryDsl,
    pooled_connection::{AsyncDieselConnectionManager, bb8::Pool},
};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use http_body_util::BodyExt;
use jsonwebtoken::{EncodingKey, Header, encode};
use rust_decimal::Decimal;
use serde_json::{Value, json};
use tastebud_foodservice::{
    build_app,
    models::{
        CreateCartEntity, CreateCartItemEntity, CreateCategoryEntity, CreateMenuItemEntity,
        CreateOfferEntity, CreateOrderEntity, CreateUserEntity, OfferEntity, OrderEntity,
    },
    platform::{app_error::AppError, app_state::AppState, config},
    schema::{cart_items, carts, categories, menu_items, offers, order_items, orders, users},
    services::{
        offers::{claim_offer, release_offer},
        order_status::OrderStatus,
        orders::{Fulfillment, PaymentMethod, change_status, generate_order_number},
    },
};
use tower::ServiceExt;
use uuid::Uuid;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");
const JWT_SECRET: &str = "db-test-secret";

fn database_url() -> Option<String> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;

    static MIGRATED: OnceLock<()> = OnceLock::new();
    MIGRATED.get_or_init(|| {
        let mut conn = PgConnection::establish(&url).unwrap();
        conn.run_pending_migrations(MIGRATIONS).unwrap();
    });
    Some(url)
}

/// A connection whose writes are rolled back when it is dropped.
async fn test_connection() -> Option<AsyncPgConnection> {
    let url = database_url()?;
    let mut conn = AsyncPgConnection::establish(&url).await.unwrap();
    conn.begin_test_transaction().await.unwrap();
    Some(conn)
}

async fn insert_user(conn: &mut AsyncPgConnection, loyalty_points: i32) -> (i32, String) {
    let auth_provider_id = format!("usr_{}", Uuid::new_v4().simple());
    let id: i32 = diesel::insert_into(users::table)
        .values(CreateUserEntity {
            auth_provider_id: auth_provider_id.clone(),
            email: None,
            name: Some("Asha".into()),
            phone: None,
        })
        .returning(users::id)
        .get_result(conn)
        .await
        .unwrap();
    diesel::update(users::table.find(id))
        .set(users::loyalty_points.eq(loyalty_points))
        .execute(conn)
        .await
        .unwrap();
    (id, auth_provider_id)
}

async fn insert_offer(conn: &mut AsyncPgConnection, usage_limit: Option<i32>) -> i32 {
    let now = Utc::now();
    diesel::insert_into(offers::table)
        .values(CreateOfferEntity {
            title: "Weekend feast".into(),
            description: None,
            image_url: None,
            kind: "coupon".into(),
            code: Some(format!("FEAST{}", &Uuid::new_v4().simple().to_string()[..8]).to_uppercase()),
            discount_type: "percentage".into(),
            discount_value: Decimal::from(10),
            max_discount: None,
            min_order_amount: Decimal::ZERO,
            starts_at: now - Duration::hours(1),
            ends_at: now + Duration::days(1),
            target_audience: "all".into(),
            usage_limit,
            is_active: true,
            priority: 0,
        })
        .returning(offers::id)
        .get_result(conn)
        .await
        .unwrap()
}

async fn insert_order(
    conn: &mut AsyncPgConnection,
    user_id: i32,
    status: OrderStatus,
    points_redeemed: i32,
    offer_id: Option<i32>,
) -> OrderEntity {
    let total = Decimal::new(45075, 2);
    diesel::insert_into(orders::table)
        .values(CreateOrderEntity {
            order_number: generate_order_number(Utc::now()),
            user_id,
            status: status.as_str().into(),
            fulfillment: Fulfillment::Pickup.as_str().into(),
            payment_method: PaymentMethod::Cod.as_str().into(),
            delivery_address: None,
            offer_id,
            subtotal: total,
            offer_discount: Decimal::ZERO,
            loyalty_discount: Decimal::ZERO,
            delivery_fee: Decimal::ZERO,
            total,
            points_redeemed,
            notes: None,
        })
        .returning(OrderEntity::as_returning())
        .get_result(conn)
        .await
        .unwrap()
}

async fn used_count(conn: &mut AsyncPgConnection, offer_id: i32) -> i32 {
    offers::table
        .find(offer_id)
        .select(offers::used_count)
        .get_result(conn)
        .await
        .unwrap()
}

async fn loyalty_points(conn: &mut AsyncPgConnection, user_id: i32) -> i32 {
    users::table
        .find(user_id)
        .select(users::loyalty_points)
        .get_result(conn)
        .await
        .unwrap()
}

#[tokio::test]
async fn offer_claims_stop_at_the_usage_limit() {
    let Some(mut conn) = test_connection().await else {
        return;
    };
    let offer_id = insert_offer(&mut conn, Some(1)).await;

    claim_offer(&mut conn, offer_id).await.unwrap();
    let err = claim_offer(&mut conn, offer_id).await.unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));
    assert_eq!(used_count(&mut conn, offer_id).await, 1);

    release_offer(&mut conn, offer_id).await.unwrap();
    release_offer(&mut conn, offer_id).await.unwrap();
    assert_eq!(used_count(&mut conn, offer_id).await, 0);

    claim_offer(&mut conn, offer_id).await.unwrap();
}

#[tokio::test]
async fn cancelling_refunds_points_and_releases_the_offer() {
    let Some(mut conn) = test_connection().await else {
        return;
    };
    let (user_id, _) = insert_user(&mut conn, 100).await;
    let offer_id = insert_offer(&mut conn, Some(5)).await;
    claim_offer(&mut conn, offer_id).await.unwrap();
    let order = insert_order(&mut conn, user_id, OrderStatus::Pending, 500, Some(offer_id)).await;

    let cancelled = change_status(&mut conn, order.id, OrderStatus::Cancelled, 1)
        .await
        .unwrap();

    assert_eq!(cancelled.status, OrderStatus::Cancelled.as_str());
    assert_eq!(loyalty_points(&mut conn, user_id).await, 600);
    assert_eq!(used_count(&mut conn, offer_id).await, 0);
}

#[tokio::test]
async fn delivering_earns_points_once() {
    let Some(mut conn) = test_connection().await else {
        return;
    };
    let (user_id, _) = insert_user(&mut conn, 0).await;
    let order = insert_order(&mut conn, user_id, OrderStatus::OutForDelivery, 0, None).await;

    let delivered = change_status(&mut conn, order.id, OrderStatus::Delivered, 1)
        .await
        .unwrap();
    assert_eq!(delivered.points_earned, 450);
    assert_eq!(loyalty_points(&mut conn, user_id).await, 450);

    let err = change_status(&mut conn, order.id, OrderStatus::Cancelled, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));
    assert_eq!(loyalty_points(&mut conn, user_id).await, 450);
}

/// Goes through HTTP with committed rows, so every name it creates is unique.
#[tokio::test]
async fn placing_an_order_snapshots_the_cart_and_claims_the_offer() {
    let Some(url) = database_url() else {
        return;
    };
    let mut conn = AsyncPgConnection::establish(&url).await.unwrap();

    let (user_id, auth_provider_id) = insert_user(&mut conn, 0).await;
    let offer_id = insert_offer(&mut conn, None).await;
    let category_id: i32 = diesel::insert_into(categories::table)
        .values(CreateCategoryEntity {
            name: format!("Mains {}", Uuid::new_v4().simple()),
            description: None,
            image_url: None,
            sort_order: 0,
        })
        .returning(categories::id)
        .get_result(&mut conn)
        .await
        .unwrap();
    let menu_item_id: i32 = diesel::insert_into(menu_items::table)
        .values(CreateMenuItemEntity {
            category_id,
            name: "Paneer tikka".into(),
            description: None,
            price: Decimal::new(24950, 2),
            image_url: None,
            is_available: true,
            is_vegetarian: true,
            is_featured: false,
        })
        .returning(menu_items::id)
        .get_result(&mut conn)
        .await
        .unwrap();
    let cart_id: i32 = diesel::insert_into(carts::table)
        .values(CreateCartEntity {
            user_id: Some(user_id),
            session_id: None,
        })
        .returning(carts::id)
        .get_result(&mut conn)
        .await
        .unwrap();
    diesel::insert_into(cart_items::table)
        .values(CreateCartItemEntity {
            cart_id,
            menu_item_id,
            quantity: 2,
            instructions: Some("Extra mint chutney".into()),
            unit_price: Decimal::new(24950, 2),
        })
        .execute(&mut conn)
        .await
        .unwrap();

    let config = config::load_from(|key| match key {
        "DATABASE_URL" => Some(url.clone()),
        "AUTH_JWT_SECRET" => Some(JWT_SECRET.into()),
        "AUTH_WEBHOOK_SECRET" => Some("webhook-secret".into()),
        _ => None,
    })
    .unwrap();
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&url);
    let pool = Pool::builder().max_size(2).build(manager).await.unwrap();
    let app = build_app(AppState::new(pool, config).unwrap()).unwrap();

    let token = encode(
        &Header::default(),
        &json!({ "sub": auth_provider_id, "exp": Utc::now().timestamp() + 3600 }),
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap();
    let request = Request::builder()
        .method("POST")
        .uri("/customers/orders")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({
                "fulfillment": "pickup",
                "payment_method": "cod",
                "offer_id": offer_id
            })
            .to_string(),
        ))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();

    let items = body["data"]["order_items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["name"], "Paneer tikka");
    assert_eq!(items[0]["quantity"], 2);
    assert_eq!(items[0]["instructions"], "Extra mint chutney");
    assert_eq!(body["data"]["order"]["offer_id"], offer_id);

    // Menu edits after the fact leave the order lines alone.
    diesel::update(menu_items::table.find(menu_item_id))
        .set(menu_items::name.eq("Paneer tikka (large)"))
        .execute(&mut conn)
        .await
        .unwrap();
    let order: OrderEntity = orders::table
        .filter(orders::user_id.eq(user_id))
        .select(OrderEntity::as_select())
        .get_result(&mut conn)
        .await
        .unwrap();
    let names: Vec<String> = order_items::table
        .filter(order_items::order_id.eq(order.id))
        .select(order_items::name)
        .load(&mut conn)
        .await
        .unwrap();
    assert_eq!(names, vec!["Paneer tikka".to_owned()]);

    let remaining: i64 = cart_items::table
        .filter(cart_items::cart_id.eq(cart_id))
        .count()
        .get_result(&mut conn)
        .await
        .unwrap();
    assert_eq!(remaining, 0);

    let offer: OfferEntity = offers::table
        .find(offer_id)
        .select(OfferEntity::as_select())
        .get_result(&mut conn)
        .await
        .unwrap();
    assert_eq!(offer.used_count, 1);
}
