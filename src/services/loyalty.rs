//! Loyalty points: 1000 points redeem for 10 currency units.

use anyhow::Context;
use diesel::{ExpressionMethods, QueryDsl};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use rust_decimal::{Decimal, prelude::ToPrimitive};

use crate::{
    models::CreateLoyaltyTransactionEntity,
    platform::app_error::AppError,
    schema::{loyalty_transactions, users},
};

pub const POINTS_PER_BLOCK: i32 = 1000;
pub const BLOCK_VALUE: i64 = 10;

pub const REASON_EARNED: &str = "order_delivered";
pub const REASON_REDEEMED: &str = "order_redeemed";
pub const REASON_REFUNDED: &str = "order_cancelled";
pub const REASON_ADJUSTED: &str = "admin_adjustment";

/// `floor(points / 1000) * 10`.
pub fn discount_for_points(points: i32) -> Decimal {
    let blocks = points.max(0) / POINTS_PER_BLOCK;
    Decimal::from(i64::from(blocks) * BLOCK_VALUE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Redemption {
    pub points: i32,
    pub discount: Decimal,
}

impl Redemption {
    pub const NONE: Redemption = Redemption {
        points: 0,
        discount: Decimal::ZERO,
    };
}

/// Redeems whole blocks of points without the discount exceeding `amount_due`.
pub fn redeem(points: i32, amount_due: Decimal) -> Redemption {
    if points < POINTS_PER_BLOCK || amount_due <= Decimal::ZERO {
        return Redemption::NONE;
    }

    let available_blocks = i64::from(points / POINTS_PER_BLOCK);
    let affordable_blocks = (amount_due / Decimal::from(BLOCK_VALUE))
        .floor()
        .to_i64()
        .unwrap_or(0);
    let blocks = available_blocks.min(affordable_blocks);

    match i32::try_from(blocks) {
        Ok(blocks) if blocks > 0 => Redemption {
            points: blocks * POINTS_PER_BLOCK,
            discount: Decimal::from(i64::from(blocks) * BLOCK_VALUE),
        },
        _ => Redemption::NONE,
    }
}

/// Points earned for a delivered order: `floor(total) * points_per_unit`.
pub fn points_earned(total: Decimal, points_per_unit: i32) -> i32 {
    let whole_units = total.floor().to_i64().unwrap_or(0).max(0);
    let points = whole_units.saturating_mul(i64::from(points_per_unit.max(0)));
    i32::try_from(points).unwrap_or(i32::MAX)
}

/// Applies a signed adjustment; `None` if the balance would go negative or overflow.
pub fn apply_delta(balance: i32, delta: i32) -> Option<i32> {
    balance.checked_add(delta).filter(|points| *points >= 0)
}

/// Changes a user's balance by `delta` and appends a ledger row. Returns the new balance.
///
/// The update only matches while the result stays non-negative, so an
/// overdraft surfaces as a 400 instead of a constraint violation.
pub async fn record_points(
    conn: &mut AsyncPgConnection,
    user_id: i32,
    order_id: Option<i32>,
    delta: i32,
    reason: &str,
) -> Result<i32, AppError> {
    if delta == 0 {
        return users::table
            .find(user_id)
            .select(users::loyalty_points)
            .get_result(conn)
            .await
            .map_err(AppError::from);
    }

    let balance: i32 = diesel::update(
        users::table
            .find(user_id)
            .filter((users::loyalty_points + delta).ge(0)),
    )
    .set((
        users::loyalty_points.eq(users::loyalty_points + delta),
        users::updated_at.eq(diesel::dsl::now),
    ))
    .returning(users::loyalty_points)
    .get_result(conn)
    .await
    .map_err(|err| match err {
        diesel::result::Error::NotFound => {
            AppError::BadRequest("Not enough loyalty points".into())
        }
        err => AppError::Other(err.into()),
    })?;

    diesel::insert_into(loyalty_transactions::table)
        .values(CreateLoyaltyTransactionEntity {
            user_id,
            order_id,
            delta,
            reason: reason.to_owned(),
        })
        .execute(conn)
        .await
        .context("Failed to record loyalty transaction")?;

    Ok(balance)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discount_is_ten_per_thousand_points() {
        assert_eq!(discount_for_points(0), Decimal::ZERO);
        assert_eq!(discount_for_points(999), Decimal::ZERO);
        assert_eq!(discount_for_points(1000), Decimal::from(10));
        assert_eq!(discount_for_points(2999), Decimal::from(20));
        assert_eq!(discount_for_points(12_500), Decimal::from(120));
        assert_eq!(discount_for_points(-5), Decimal::ZERO);
    }

    #[test]
    fn redeems_whole_blocks() {
        let redemption = redeem(3500, Decimal::from(500));
        assert_eq!(redemption.points, 3000);
        assert_eq!(redemption.discount, Decimal::from(30));
    }

    #[test]
    fn redemption_never_exceeds_amount_due() {
        let redemption = redeem(10_000, Decimal::new(2550, 2));
        assert_eq!(redemption.points, 2000);
        assert_eq!(redemption.discount, Decimal::from(20));

        assert_eq!(redeem(10_000, Decimal::new(999, 2)), Redemption::NONE);
        assert_eq!(redeem(500, Decimal::from(100)), Redemption::NONE);
        assert_eq!(redeem(5000, Decimal::ZERO), Redemption::NONE);
    }

    #[test]
    fn earning_uses_whole_currency_units() {
        assert_eq!(points_earned(Decimal::new(24999, 2), 1), 249);
        assert_eq!(points_earned(Decimal::new(24999, 2), 2), 498);
        assert_eq!(points_earned(Decimal::ZERO, 1), 0);
    }

    #[test]
    fn points_accumulate_additively() {
        let balance = [120, 340, 1000]
            .into_iter()
            .try_fold(0, apply_delta)
            .unwrap();
        assert_eq!(balance, 1460);
        assert_eq!(discount_for_points(balance), Decimal::from(10));
    }

    #[test]
    fn balance_never_goes_negative() {
        assert_eq!(apply_delta(100, -100), Some(0));
        assert_eq!(apply_delta(100, -101), None);
        assert_eq!(apply_delta(i32::MAX, 1), None);
    }
}
