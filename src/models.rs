use chrono::{DateTime, Utc};
use diesel::{
    Selectable,
    prelude::{AsChangeset, Identifiable, Insertable, Queryable},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

// Users

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::users)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct UserEntity {
    pub id: i32,
    #[serde(skip_serializing)]
    pub auth_provider_id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub phone_verified: bool,
    pub role: String,
    pub loyalty_points: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing)]
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::users)]
pub struct CreateUserEntity {
    pub auth_provider_id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub phone: Option<String>,
}

#[derive(AsChangeset, Debug, Default)]
#[diesel(table_name = crate::schema::users)]
pub struct UpdateUserEntity {
    pub email: Option<String>,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub phone_verified: Option<bool>,
    pub role: Option<String>,
}

#[derive(Queryable, Selectable, Serialize, Debug, ToSchema)]
#[diesel(table_name = crate::schema::loyalty_transactions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct LoyaltyTransactionEntity {
    pub id: i32,
    pub user_id: i32,
    pub order_id: Option<i32>,
    pub delta: i32,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::loyalty_transactions)]
pub struct CreateLoyaltyTransactionEntity {
    pub user_id: i32,
    pub order_id: Option<i32>,
    pub delta: i32,
    pub reason: String,
}

// Addresses

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::addresses)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct AddressEntity {
    pub id: i32,
    pub user_id: i32,
    pub label: String,
    pub line1: String,
    pub line2: Option<String>,
    pub city: String,
    pub postal_code: String,
    pub landmark: Option<String>,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::addresses)]
pub struct CreateAddressEntity {
    pub user_id: i32,
    pub label: String,
    pub line1: String,
    pub line2: Option<String>,
    pub city: String,
    pub postal_code: String,
    pub landmark: Option<String>,
    pub is_default: bool,
}

#[derive(AsChangeset, Debug, Default)]
#[diesel(table_name = crate::schema::addresses)]
pub struct UpdateAddressEntity {
    pub label: Option<String>,
    pub line1: Option<String>,
    pub line2: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub landmark: Option<String>,
}

// Catalog

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::categories)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CategoryEntity {
    pub id: i32,
    pub name: String,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub sort_order: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::categories)]
pub struct CreateCategoryEntity {
    pub name: String,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub sort_order: i32,
}

#[derive(AsChangeset, Debug, Default)]
#[diesel(table_name = crate::schema::categories)]
pub struct UpdateCategoryEntity {
    pub name: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub sort_order: Option<i32>,
}

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::menu_items)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct MenuItemEntity {
    pub id: i32,
    pub category_id: i32,
    pub name: String,
    pub description: Option<String>,
    pub price: Decimal,
    pub image_url: Option<String>,
    pub is_available: bool,
    pub is_vegetarian: bool,
    pub is_featured: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::menu_items)]
pub struct CreateMenuItemEntity {
    pub category_id: i32,
    pub name: String,
    pub description: Option<String>,
    pub price: Decimal,
    pub image_url: Option<String>,
    pub is_available: bool,
    pub is_vegetarian: bool,
    pub is_featured: bool,
}

#[derive(AsChangeset, Debug, Default)]
#[diesel(table_name = crate::schema::menu_items)]
pub struct UpdateMenuItemEntity {
    pub category_id: Option<i32>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub price: Option<Decimal>,
    pub image_url: Option<String>,
    pub is_vegetarian: Option<bool>,
    pub is_featured: Option<bool>,
}

// Carts

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::carts)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CartEntity {
    pub id: i32,
    pub user_id: Option<i32>,
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::carts)]
pub struct CreateCartEntity {
    pub user_id: Option<i32>,
    pub session_id: Option<String>,
}

#[derive(Queryable, Selectable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::cart_items)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CartItemEntity {
    pub id: i32,
    pub cart_id: i32,
    pub menu_item_id: i32,
    pub quantity: i32,
    pub instructions: Option<String>,
    pub unit_price: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::cart_items)]
pub struct CreateCartItemEntity {
    pub cart_id: i32,
    pub menu_item_id: i32,
    pub quantity: i32,
    pub instructions: Option<String>,
    pub unit_price: Decimal,
}

// Offers

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::offers)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct OfferEntity {
    pub id: i32,
    pub title: String,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub kind: String,
    pub code: Option<String>,
    pub discount_type: String,
    pub discount_value: Decimal,
    pub max_discount: Option<Decimal>,
    pub min_order_amount: Decimal,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub target_audience: String,
    pub usage_limit: Option<i32>,
    pub used_count: i32,
    pub is_active: bool,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::offers)]
pub struct CreateOfferEntity {
    pub title: String,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub kind: String,
    pub code: Option<String>,
    pub discount_type: String,
    pub discount_value: Decimal,
    pub max_discount: Option<Decimal>,
    pub min_order_amount: Decimal,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub target_audience: String,
    pub usage_limit: Option<i32>,
    pub is_active: bool,
    pub priority: i32,
}

#[derive(AsChangeset, Debug, Default)]
#[diesel(table_name = crate::schema::offers)]
pub struct UpdateOfferEntity {
    pub title: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub kind: Option<String>,
    pub code: Option<String>,
    pub discount_type: Option<String>,
    pub discount_value: Option<Decimal>,
    pub max_discount: Option<Decimal>,
    pub min_order_amount: Option<Decimal>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub target_audience: Option<String>,
    pub usage_limit: Option<i32>,
    pub is_active: Option<bool>,
    pub priority: Option<i32>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::offer_interactions)]
pub struct CreateOfferInteractionEntity {
    pub offer_id: i32,
    pub user_id: Option<i32>,
    pub session_id: Option<String>,
    pub event: String,
}

#[derive(Queryable, Selectable, Serialize, Debug, ToSchema)]
#[diesel(table_name = crate::schema::offer_interactions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct OfferInteractionEntity {
    pub id: i32,
    pub offer_id: i32,
    pub user_id: Option<i32>,
    pub session_id: Option<String>,
    pub event: String,
    pub created_at: DateTime<Utc>,
}

// Orders

#[derive(Queryable, Serialize, Selectable, Identifiable, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::orders)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct OrderEntity {
    pub id: i32,
    pub order_number: String,
    pub user_id: i32,
    pub status: String,
    pub fulfillment: String,
    pub payment_method: String,
    pub delivery_address: Option<Value>,
    pub offer_id: Option<i32>,
    pub subtotal: Decimal,
    pub offer_discount: Decimal,
    pub loyalty_discount: Decimal,
    pub delivery_fee: Decimal,
    pub total: Decimal,
    pub points_redeemed: i32,
    pub points_earned: i32,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::orders)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CreateOrderEntity {
    pub order_number: String,
    pub user_id: i32,
    pub status: String,
    pub fulfillment: String,
    pub payment_method: String,
    pub delivery_address: Option<Value>,
    pub offer_id: Option<i32>,
    pub subtotal: Decimal,
    pub offer_discount: Decimal,
    pub loyalty_discount: Decimal,
    pub delivery_fee: Decimal,
    pub total: Decimal,
    pub points_redeemed: i32,
    pub notes: Option<String>,
}

#[derive(Queryable, Serialize, Selectable, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::order_items)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct OrderItemEntity {
    pub id: i32,
    pub order_id: i32,
    pub menu_item_id: Option<i32>,
    pub name: String,
    pub unit_price: Decimal,
    pub quantity: i32,
    pub instructions: Option<String>,
    pub line_total: Decimal,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::order_items)]
pub struct CreateOrderItemEntity {
    pub order_id: i32,
    pub menu_item_id: Option<i32>,
    pub name: String,
    pub unit_price: Decimal,
    pub quantity: i32,
    pub instructions: Option<String>,
    pub line_total: Decimal,
}

// Payments

#[derive(Queryable, Serialize, Selectable, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::payments)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct PaymentEntity {
    pub id: Uuid,
    pub order_id: i32,
    pub amount: Decimal,
    pub currency: String,
    pub status: String,
    pub provider: String,
    pub provider_ref: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Serialize, Deserialize, Debug)]
#[diesel(table_name = crate::schema::payments)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CreatePaymentEntity {
    pub order_id: i32,
    pub amount: Decimal,
    pub currency: String,
    pub provider: String,
    pub provider_ref: Option<String>,
    pub status: String,
}

// OTP

#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = crate::schema::otp_codes)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct OtpCodeEntity {
    pub id: i32,
    pub user_id: i32,
    pub phone: String,
    pub code_hash: String,
    pub attempts: i32,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::otp_codes)]
pub struct CreateOtpCodeEntity {
    pub user_id: i32,
    pub phone: String,
    pub code_hash: String,
    pub expires_at: DateTime<Utc>,
}

// Outbox

#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = crate::schema::outbox)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct OutboxEntity {
    pub id: i32,
    pub event_type: String,
    pub payload: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::outbox)]
pub struct CreateOutboxEntity {
    pub event_type: String,
    pub payload: String,
}
