use anyhow::Context;
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use rust_decimal::Decimal;
use serde::Serialize;
use utoipa::ToSchema;

use crate::{
    models::{CartEntity, CartItemEntity, CreateCartEntity, MenuItemEntity},
    platform::{app_error::AppError, middleware::Viewer},
    schema::{cart_items, carts, menu_items},
    services::pricing,
};

pub const MAX_LINE_QUANTITY: i32 = 50;

pub async fn find_cart(
    conn: &mut AsyncPgConnection,
    viewer: &Viewer,
) -> Result<Option<CartEntity>, AppError> {
    let query = carts::table.select(CartEntity::as_select()).into_boxed();
    let query = match viewer {
        Viewer::User(user) => query.filter(carts::user_id.eq(user.id)),
        Viewer::Session(session_id) => query.filter(carts::session_id.eq(session_id.as_str())),
    };

    let cart = query
        .first(conn)
        .await
        .optional()
        .context("Failed to get cart")?;

    Ok(cart)
}

pub async fn find_or_create_cart(
    conn: &mut AsyncPgConnection,
    viewer: &Viewer,
) -> Result<CartEntity, AppError> {
    if let Some(cart) = find_cart(conn, viewer).await? {
        return Ok(cart);
    }

    diesel::insert_into(carts::table)
        .values(CreateCartEntity {
            user_id: viewer.user_id(),
            session_id: viewer.session_id().map(str::to_owned),
        })
        .on_conflict_do_nothing()
        .execute(conn)
        .await
        .context("Failed to create cart")?;

    find_cart(conn, viewer).await?.ok_or(AppError::NotFound)
}

/// Cart lines joined with the menu items they refer to, oldest first.
pub async fn cart_lines(
    conn: &mut AsyncPgConnection,
    cart_id: i32,
) -> Result<Vec<(CartItemEntity, MenuItemEntity)>, AppError> {
    let lines = cart_items::table
        .inner_join(menu_items::table)
        .filter(cart_items::cart_id.eq(cart_id))
        .order_by(cart_items::id.asc())
        .select((CartItemEntity::as_select(), MenuItemEntity::as_select()))
        .load(conn)
        .await
        .context("Failed to get cart items")?;

    Ok(lines)
}

pub async fn touch_cart(conn: &mut AsyncPgConnection, cart_id: i32) -> Result<(), AppError> {
    diesel::update(carts::table.find(cart_id))
        .set(carts::updated_at.eq(diesel::dsl::now))
        .execute(conn)
        .await
        .context("Failed to update cart timestamp")?;
    Ok(())
}

#[derive(Serialize, ToSchema, Debug)]
pub struct CartLine {
    pub item: CartItemEntity,
    pub name: String,
    pub image_url: Option<String>,
    pub current_price: Decimal,
    pub is_available: bool,
    /// The catalog price moved since the item was added.
    pub price_changed: bool,
    pub line_total: Decimal,
}

#[derive(Serialize, ToSchema, Debug)]
pub struct CartView {
    pub cart: CartEntity,
    pub lines: Vec<CartLine>,
    pub subtotal: Decimal,
    pub item_count: i32,
}

impl CartView {
    pub fn new(cart: CartEntity, lines: Vec<(CartItemEntity, MenuItemEntity)>) -> Self {
        let lines: Vec<CartLine> = lines
            .into_iter()
            .map(|(item, menu_item)| CartLine {
                line_total: pricing::line_total(menu_item.price, item.quantity),
                price_changed: item.unit_price != menu_item.price,
                name: menu_item.name,
                image_url: menu_item.image_url,
                current_price: menu_item.price,
                is_available: menu_item.is_available,
                item,
            })
            .collect();

        let subtotal = lines.iter().map(|line| line.line_total).sum();
        let item_count = lines.iter().map(|line| line.item.quantity).sum();

        Self {
            cart,
            lines,
            subtotal,
            item_count,
        }
    }
}

/// Names of lines whose menu item has been switched off.
pub fn unavailable_items(lines: &[(CartItemEntity, MenuItemEntity)]) -> Vec<String> {
    lines
        .iter()
        .filter(|(_, menu_item)| !menu_item.is_available)
        .map(|(_, menu_item)| menu_item.name.clone())
        .collect()
}

/// Lines whose snapshotted price no longer matches the catalog, with the current price.
pub fn repriced_lines(lines: &[(CartItemEntity, MenuItemEntity)]) -> Vec<(i32, Decimal, String)> {
    lines
        .iter()
        .filter(|(item, menu_item)| item.unit_price != menu_item.price)
        .map(|(item, menu_item)| (item.id, menu_item.price, menu_item.name.clone()))
        .collect()
}

/// Copies the current catalog price onto the given lines.
pub async fn refresh_prices(
    conn: &mut AsyncPgConnection,
    repriced: &[(i32, Decimal, String)],
) -> Result<(), AppError> {
    for (line_id, price, _) in repriced {
        diesel::update(cart_items::table.find(*line_id))
            .set((
                cart_items::unit_price.eq(*price),
                cart_items::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)
            .await
            .context("Failed to refresh cart price")?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::Utc;

    use super::*;

    pub(crate) fn menu_item(id: i32, price: Decimal, available: bool) -> MenuItemEntity {
        let now = Utc::now();
        MenuItemEntity {
            id,
            category_id: 1,
            name: format!("Dish {id}"),
            description: None,
            price,
            image_url: None,
            is_available: available,
            is_vegetarian: false,
            is_featured: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn cart_item(id: i32, menu_item_id: i32, quantity: i32, unit_price: Decimal) -> CartItemEntity {
        let now = Utc::now();
        CartItemEntity {
            id,
            cart_id: 1,
            menu_item_id,
            quantity,
            instructions: None,
            unit_price,
            created_at: now,
            updated_at: now,
        }
    }

    fn cart() -> CartEntity {
        let now = Utc::now();
        CartEntity {
            id: 1,
            user_id: None,
            session_id: Some("anon-session-1".into()),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn totals_are_sums_of_lines() {
        let lines = vec![
            (cart_item(1, 10, 2, Decimal::new(15000, 2)), menu_item(10, Decimal::new(15000, 2), true)),
            (cart_item(2, 11, 3, Decimal::new(4000, 2)), menu_item(11, Decimal::new(4000, 2), true)),
        ];
        let view = CartView::new(cart(), lines);
        assert_eq!(view.subtotal, Decimal::new(42000, 2));
        assert_eq!(view.item_count, 5);
        assert!(view.lines.iter().all(|line| !line.price_changed));
    }

    #[test]
    fn flags_price_changes_and_uses_current_price() {
        let lines = vec![(
            cart_item(1, 10, 2, Decimal::new(15000, 2)),
            menu_item(10, Decimal::new(17500, 2), true),
        )];
        let view = CartView::new(cart(), lines);
        assert!(view.lines[0].price_changed);
        assert_eq!(view.subtotal, Decimal::new(35000, 2));
    }

    #[test]
    fn empty_cart_totals_zero() {
        let view = CartView::new(cart(), Vec::new());
        assert_eq!(view.subtotal, Decimal::ZERO);
        assert_eq!(view.item_count, 0);
    }

    #[test]
    fn finds_unavailable_and_repriced_lines() {
        let lines = vec![
            (cart_item(1, 10, 1, Decimal::new(15000, 2)), menu_item(10, Decimal::new(15000, 2), false)),
            (cart_item(2, 11, 1, Decimal::new(4000, 2)), menu_item(11, Decimal::new(4500, 2), true)),
            (cart_item(3, 12, 1, Decimal::new(9900, 2)), menu_item(12, Decimal::new(9900, 2), true)),
        ];
        assert_eq!(unavailable_items(&lines), vec!["Dish 10".to_string()]);
        assert_eq!(
            repriced_lines(&lines),
            vec![(2, Decimal::new(4500, 2), "Dish 11".to_string())]
        );
    }
}
