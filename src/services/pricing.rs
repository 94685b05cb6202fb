//! Cart and order totals.

use rust_decimal::Decimal;
use serde::Serialize;
use utoipa::ToSchema;

use crate::services::{loyalty, offers::round_money};

pub fn line_total(unit_price: Decimal, quantity: i32) -> Decimal {
    round_money(unit_price * Decimal::from(quantity))
}

/// Sum of `(unit_price, quantity)` lines.
pub fn subtotal<I>(lines: I) -> Decimal
where
    I: IntoIterator<Item = (Decimal, i32)>,
{
    lines
        .into_iter()
        .map(|(unit_price, quantity)| line_total(unit_price, quantity))
        .sum()
}

#[derive(Serialize, ToSchema, Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderTotals {
    pub subtotal: Decimal,
    pub offer_discount: Decimal,
    pub loyalty_discount: Decimal,
    pub delivery_fee: Decimal,
    pub total: Decimal,
    pub points_redeemed: i32,
}

/// `total = subtotal - offer_discount - loyalty_discount + delivery_fee`.
///
/// Loyalty points only cover what is left after the offer discount; the
/// delivery fee is always paid.
pub fn order_totals(
    subtotal: Decimal,
    offer_discount: Decimal,
    redeemable_points: Option<i32>,
    delivery_fee: Decimal,
) -> OrderTotals {
    let offer_discount = offer_discount.min(subtotal).max(Decimal::ZERO);
    let after_offer = subtotal - offer_discount;

    let redemption = match redeemable_points {
        Some(points) => loyalty::redeem(points, after_offer),
        None => loyalty::Redemption::NONE,
    };

    let total = (after_offer - redemption.discount).max(Decimal::ZERO) + delivery_fee;

    OrderTotals {
        subtotal,
        offer_discount,
        loyalty_discount: redemption.discount,
        delivery_fee,
        total: round_money(total),
        points_redeemed: redemption.points,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn money(cents: i64) -> Decimal {
        Decimal::new(cents, 2)
    }

    #[test]
    fn sums_lines() {
        let lines = [(money(24900), 2), (money(9950), 1), (money(1999), 3)];
        assert_eq!(subtotal(lines), money(49800 + 9950 + 5997));
        assert_eq!(subtotal(Vec::new()), Decimal::ZERO);
    }

    #[test]
    fn totals_without_discounts() {
        let totals = order_totals(money(50000), Decimal::ZERO, None, money(4000));
        assert_eq!(totals.total, money(54000));
        assert_eq!(totals.points_redeemed, 0);
    }

    #[test]
    fn totals_with_offer_and_points() {
        let totals = order_totals(money(50000), money(10000), Some(2500), money(4000));
        assert_eq!(totals.offer_discount, money(10000));
        assert_eq!(totals.loyalty_discount, money(2000));
        assert_eq!(totals.points_redeemed, 2000);
        assert_eq!(totals.total, money(50000 - 10000 - 2000 + 4000));
    }

    #[test]
    fn points_cannot_cover_delivery_fee() {
        let totals = order_totals(money(1500), Decimal::ZERO, Some(9000), money(4000));
        assert_eq!(totals.loyalty_discount, money(1000));
        assert_eq!(totals.points_redeemed, 1000);
        assert_eq!(totals.total, money(500 + 4000));
    }

    #[test]
    fn oversized_offer_is_clamped() {
        let totals = order_totals(money(1000), money(5000), None, Decimal::ZERO);
        assert_eq!(totals.offer_discount, money(1000));
        assert_eq!(totals.total, Decimal::ZERO);
    }
}
