//! Offer targeting and discount rules.

use std::{fmt, str::FromStr};

use anyhow::Context;
use chrono::{DateTime, Utc};
use diesel::{
    BoolExpressionMethods, ExpressionMethods, NullableExpressionMethods, OptionalExtension,
    QueryDsl, SelectableHelper,
};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::{
    models::OfferEntity,
    platform::{app_error::AppError, middleware::Viewer},
    schema::{offers, orders, users},
    services::order_status::OrderStatus,
};

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("{other} is not a valid {}", stringify!($name))),
                }
            }
        }
    };
}

string_enum!(OfferKind {
    Banner => "banner",
    Popup => "popup",
    Coupon => "coupon",
});

string_enum!(DiscountType {
    Percentage => "percentage",
    Fixed => "fixed",
});

string_enum!(TargetAudience {
    All => "all",
    NewUsers => "new_users",
    ReturningUsers => "returning_users",
    LoyaltyMembers => "loyalty_members",
    Guests => "guests",
});

string_enum!(InteractionEvent {
    View => "view",
    Click => "click",
    Dismiss => "dismiss",
});

/// What the targeting rules know about a viewer.
#[derive(Debug, Clone, Copy, Default)]
pub struct AudienceProfile {
    pub signed_in: bool,
    pub delivered_orders: i64,
    pub loyalty_points: i32,
}

impl AudienceProfile {
    pub const GUEST: AudienceProfile = AudienceProfile {
        signed_in: false,
        delivered_orders: 0,
        loyalty_points: 0,
    };

    pub fn matches(&self, audience: TargetAudience) -> bool {
        match audience {
            TargetAudience::All => true,
            TargetAudience::Guests => !self.signed_in,
            TargetAudience::NewUsers => self.signed_in && self.delivered_orders == 0,
            TargetAudience::ReturningUsers => self.signed_in && self.delivered_orders > 0,
            TargetAudience::LoyaltyMembers => self.signed_in && self.loyalty_points > 0,
        }
    }

    /// Audience tags this viewer belongs to, for filtering in SQL.
    pub fn audiences(&self) -> Vec<&'static str> {
        TargetAudience::ALL
            .iter()
            .filter(|audience| self.matches(**audience))
            .map(TargetAudience::as_str)
            .collect()
    }
}

pub fn usage_exhausted(offer: &OfferEntity) -> bool {
    offer
        .usage_limit
        .is_some_and(|limit| offer.used_count >= limit)
}

/// Active, inside `[starts_at, ends_at)` and not used up.
pub fn is_live(offer: &OfferEntity, now: DateTime<Utc>) -> bool {
    offer.is_active && offer.starts_at <= now && now < offer.ends_at && !usage_exhausted(offer)
}

pub fn is_visible_to(offer: &OfferEntity, profile: &AudienceProfile, now: DateTime<Utc>) -> bool {
    is_live(offer, now)
        && offer
            .target_audience
            .parse::<TargetAudience>()
            .is_ok_and(|audience| profile.matches(audience))
}

/// Loads what targeting needs to know about the viewer. Sessions and
/// anonymous visitors are guests.
pub async fn audience_profile(
    conn: &mut AsyncPgConnection,
    viewer: Option<&Viewer>,
) -> Result<AudienceProfile, AppError> {
    let Some(user_id) = viewer.and_then(Viewer::user_id) else {
        return Ok(AudienceProfile::GUEST);
    };

    let loyalty_points: i32 = users::table
        .find(user_id)
        .select(users::loyalty_points)
        .get_result(conn)
        .await?;

    let delivered_orders: i64 = orders::table
        .filter(orders::user_id.eq(user_id))
        .filter(orders::status.eq(OrderStatus::Delivered.as_str()))
        .count()
        .get_result(conn)
        .await
        .context("Failed to count delivered orders")?;

    Ok(AudienceProfile {
        signed_in: true,
        delivered_orders,
        loyalty_points,
    })
}

/// Coupon codes are stored and matched uppercase.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

pub async fn find_by_code(
    conn: &mut AsyncPgConnection,
    code: &str,
) -> Result<Option<OfferEntity>, AppError> {
    let offer = offers::table
        .filter(offers::code.eq(normalize_code(code)))
        .select(OfferEntity::as_select())
        .first(conn)
        .await
        .optional()
        .context("Failed to get offer by code")?;
    Ok(offer)
}

/// Takes one use of an offer; fails once its usage limit is reached.
pub async fn claim_offer(conn: &mut AsyncPgConnection, offer_id: i32) -> Result<(), AppError> {
    let claimed = diesel::update(
        offers::table.find(offer_id).filter(
            offers::usage_limit
                .is_null()
                .or(offers::used_count.lt(offers::usage_limit.assume_not_null())),
        ),
    )
    .set((
        offers::used_count.eq(offers::used_count + 1),
        offers::updated_at.eq(diesel::dsl::now),
    ))
    .execute(conn)
    .await
    .context("Failed to claim offer")?;

    if claimed == 0 {
        return Err(AppError::BadRequest("This offer has been fully redeemed".into()));
    }
    Ok(())
}

/// Gives back a use taken by [`claim_offer`].
pub async fn release_offer(conn: &mut AsyncPgConnection, offer_id: i32) -> Result<(), AppError> {
    diesel::update(offers::table.find(offer_id).filter(offers::used_count.gt(0)))
        .set((
            offers::used_count.eq(offers::used_count - 1),
            offers::updated_at.eq(diesel::dsl::now),
        ))
        .execute(conn)
        .await
        .context("Failed to release offer")?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscountError {
    #[error("This offer requires a minimum order of {0}")]
    BelowMinimum(Decimal),
    #[error("{0} is not a discount type")]
    InvalidType(String),
}

impl From<DiscountError> for AppError {
    fn from(err: DiscountError) -> Self {
        match err {
            DiscountError::BelowMinimum(_) => AppError::BadRequest(err.to_string()),
            DiscountError::InvalidType(_) => AppError::Other(err.into()),
        }
    }
}

pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Discount an offer grants on `subtotal`, never more than the subtotal itself.
pub fn discount_for(offer: &OfferEntity, subtotal: Decimal) -> Result<Decimal, DiscountError> {
    if subtotal < offer.min_order_amount {
        return Err(DiscountError::BelowMinimum(offer.min_order_amount));
    }

    let discount_type = offer
        .discount_type
        .parse::<DiscountType>()
        .map_err(|_| DiscountError::InvalidType(offer.discount_type.clone()))?;

    let raw = match discount_type {
        DiscountType::Percentage => {
            let amount = subtotal * offer.discount_value / Decimal::ONE_HUNDRED;
            match offer.max_discount {
                Some(cap) => amount.min(cap),
                None => amount,
            }
        }
        DiscountType::Fixed => offer.discount_value,
    };

    Ok(round_money(raw.max(Decimal::ZERO).min(subtotal)))
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::Duration;

    use super::*;

    pub(crate) fn offer() -> OfferEntity {
        let now = Utc::now();
        OfferEntity {
            id: 1,
            title: "Weekend feast".into(),
            description: None,
            image_url: None,
            kind: "coupon".into(),
            code: Some("FEAST20".into()),
            discount_type: "percentage".into(),
            discount_value: Decimal::from(20),
            max_discount: Some(Decimal::from(100)),
            min_order_amount: Decimal::from(200),
            starts_at: now - Duration::days(1),
            ends_at: now + Duration::days(1),
            target_audience: "all".into(),
            usage_limit: None,
            used_count: 0,
            is_active: true,
            priority: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn percentage_discount_is_capped() {
        let offer = offer();
        assert_eq!(discount_for(&offer, Decimal::from(300)), Ok(Decimal::from(60)));
        assert_eq!(discount_for(&offer, Decimal::from(1000)), Ok(Decimal::from(100)));
    }

    #[test]
    fn percentage_discount_rounds_to_cents() {
        let mut offer = offer();
        offer.discount_value = Decimal::new(125, 1);
        offer.max_discount = None;
        // 12.5% of 201.99 = 25.24875
        assert_eq!(
            discount_for(&offer, Decimal::new(20199, 2)),
            Ok(Decimal::new(2525, 2))
        );
    }

    #[test]
    fn fixed_discount_never_exceeds_subtotal() {
        let mut offer = offer();
        offer.discount_type = "fixed".into();
        offer.discount_value = Decimal::from(500);
        offer.min_order_amount = Decimal::ZERO;
        assert_eq!(discount_for(&offer, Decimal::from(120)), Ok(Decimal::from(120)));
    }

    #[test]
    fn minimum_order_is_enforced() {
        let offer = offer();
        assert_eq!(
            discount_for(&offer, Decimal::from(199)),
            Err(DiscountError::BelowMinimum(Decimal::from(200)))
        );
    }

    #[test]
    fn respects_validity_window() {
        let now = Utc::now();
        let mut offer = offer();
        assert!(is_live(&offer, now));

        offer.starts_at = now + Duration::hours(1);
        assert!(!is_live(&offer, now));

        let mut offer = self::offer();
        offer.ends_at = now;
        assert!(!is_live(&offer, now));

        let mut offer = self::offer();
        offer.is_active = false;
        assert!(!is_live(&offer, now));
    }

    #[test]
    fn exhausted_offers_are_not_live() {
        let mut offer = offer();
        offer.usage_limit = Some(3);
        offer.used_count = 3;
        assert!(usage_exhausted(&offer));
        assert!(!is_live(&offer, Utc::now()));
    }

    #[test]
    fn targets_audiences() {
        let new_user = AudienceProfile {
            signed_in: true,
            delivered_orders: 0,
            loyalty_points: 0,
        };
        let regular = AudienceProfile {
            signed_in: true,
            delivered_orders: 4,
            loyalty_points: 1200,
        };

        assert!(AudienceProfile::GUEST.matches(TargetAudience::Guests));
        assert!(!AudienceProfile::GUEST.matches(TargetAudience::NewUsers));
        assert!(new_user.matches(TargetAudience::NewUsers));
        assert!(!new_user.matches(TargetAudience::ReturningUsers));
        assert!(!new_user.matches(TargetAudience::LoyaltyMembers));
        assert!(regular.matches(TargetAudience::ReturningUsers));
        assert!(regular.matches(TargetAudience::LoyaltyMembers));
        assert!(!regular.matches(TargetAudience::Guests));

        assert_eq!(AudienceProfile::GUEST.audiences(), vec!["all", "guests"]);
        assert_eq!(new_user.audiences(), vec!["all", "new_users"]);
    }

    #[test]
    fn minimum_order_is_a_bad_request() {
        let err: AppError = DiscountError::BelowMinimum(Decimal::from(200)).into();
        assert!(matches!(err, AppError::BadRequest(_)));
        assert_eq!(err.to_string(), "This offer requires a minimum order of 200");

        let err: AppError = DiscountError::InvalidType("bogo".into()).into();
        assert!(matches!(err, AppError::Other(_)));
        assert_eq!(err.to_string(), "bogo is not a discount type");
    }

    #[test]
    fn codes_are_case_insensitive() {
        assert_eq!(normalize_code("  feast20 "), "FEAST20");
    }

    #[test]
    fn visibility_combines_window_and_audience() {
        let now = Utc::now();
        let mut offer = offer();
        offer.target_audience = "new_users".into();
        assert!(!is_visible_to(&offer, &AudienceProfile::GUEST, now));

        offer.target_audience = "guests".into();
        assert!(is_visible_to(&offer, &AudienceProfile::GUEST, now));

        offer.target_audience = "everyone".into();
        assert!(!is_visible_to(&offer, &AudienceProfile::GUEST, now));
    }
}
