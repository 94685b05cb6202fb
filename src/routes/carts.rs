use std::collections::HashMap;

use anyhow::Context;
use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper, upsert::excluded};
use diesel_async::{AsyncConnection, RunQueryDsl};
use serde::Deserialize;
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;
use validator::Validate;

use crate::{
    models::{CartEntity, CartItemEntity, CreateCartItemEntity, MenuItemEntity},
    platform::{
        app_error::{AppError, StdResponse},
        app_state::AppState,
        middleware::{self, Viewer},
    },
    schema::{cart_items, carts, menu_items},
    services::carts::{
        CartView, MAX_LINE_QUANTITY, cart_lines, find_cart, find_or_create_cart, touch_cart,
    },
};

/// Cart routes, available to signed-in users and anonymous sessions alike.
pub fn routes_with_openapi(state: &AppState) -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/cart",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(get_cart))
            .routes(utoipa_axum::routes!(clear_cart))
            .routes(utoipa_axum::routes!(add_item))
            .routes(utoipa_axum::routes!(update_item))
            .routes(utoipa_axum::routes!(remove_item))
            .routes(utoipa_axum::routes!(merge_session_cart))
            .route_layer(axum::middleware::from_fn_with_state(
                state.clone(),
                middleware::viewer_identity,
            )),
    )
}

async fn load_view(
    conn: &mut diesel_async::AsyncPgConnection,
    cart: CartEntity,
) -> Result<CartView, AppError> {
    let lines = cart_lines(conn, cart.id).await?;
    Ok(CartView::new(cart, lines))
}

/// Fetch the current cart, creating it on first use.
#[utoipa::path(
    get,
    path = "/",
    tags = ["Cart"],
    security(("bearerAuth" = []), ("sessionId" = [])),
    responses(
        (status = 200, description = "Get cart successfully", body = StdResponse<CartView, String>)
    )
)]
async fn get_cart(
    State(state): State<AppState>,
    Extension(viewer): Extension<Viewer>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let cart = find_or_create_cart(conn, &viewer).await?;
    let view = load_view(conn, cart).await?;

    Ok(StdResponse {
        data: Some(view),
        message: Some("Get cart successfully"),
    })
}

/// Remove every line from the cart.
#[utoipa::path(
    delete,
    path = "/",
    tags = ["Cart"],
    security(("bearerAuth" = []), ("sessionId" = [])),
    responses(
        (status = 200, description = "Cleared cart successfully", body = StdResponse<CartView, String>)
    )
)]
async fn clear_cart(
    State(state): State<AppState>,
    Extension(viewer): Extension<Viewer>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let cart = find_or_create_cart(conn, &viewer).await?;

    diesel::delete(cart_items::table.filter(cart_items::cart_id.eq(cart.id)))
        .execute(conn)
        .await
        .context("Failed to clear cart")?;
    touch_cart(conn, cart.id).await?;

    let view = load_view(conn, cart).await?;
    Ok(StdResponse {
        data: Some(view),
        message: Some("Cleared cart successfully"),
    })
}

#[derive(Deserialize, Validate, ToSchema, Debug)]
pub struct AddCartItemReq {
    pub menu_item_id: i32,
    #[validate(range(min = 1, max = 50))]
    pub quantity: i32,
    #[validate(length(max = 500))]
    pub instructions: Option<String>,
}

/// Add a menu item to the cart. Adding an item already in the cart increases its quantity.
#[utoipa::path(
    post,
    path = "/items",
    tags = ["Cart"],
    security(("bearerAuth" = []), ("sessionId" = [])),
    request_body = AddCartItemReq,
    responses(
        (status = 200, description = "Added item successfully", body = StdResponse<CartView, String>),
        (status = 400, description = "Invalid quantity or unavailable item")
    )
)]
async fn add_item(
    State(state): State<AppState>,
    Extension(viewer): Extension<Viewer>,
    Json(body): Json<AddCartItemReq>,
) -> Result<impl IntoResponse, AppError> {
    body.validate()?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let view = conn
        .transaction(move |conn| {
            Box::pin(async move {
                let menu_item: MenuItemEntity = menu_items::table
                    .find(body.menu_item_id)
                    .select(MenuItemEntity::as_select())
                    .get_result(conn)
                    .await
                    .optional()
                    .context("Failed to get menu item")?
                    .ok_or_else(|| AppError::BadRequest("Menu item does not exist".into()))?;

                if !menu_item.is_available {
                    return Err(AppError::BadRequest(format!(
                        "{} is currently unavailable",
                        menu_item.name
                    )));
                }

                let cart = find_or_create_cart(conn, &viewer).await?;

                let line: CartItemEntity = diesel::insert_into(cart_items::table)
                    .values(CreateCartItemEntity {
                        cart_id: cart.id,
                        menu_item_id: menu_item.id,
                        quantity: body.quantity,
                        instructions: body.instructions,
                        unit_price: menu_item.price,
                    })
                    .on_conflict((cart_items::cart_id, cart_items::menu_item_id))
                    .do_update()
                    .set((
                        cart_items::quantity.eq(cart_items::quantity + excluded(cart_items::quantity)),
                        cart_items::instructions.eq(excluded(cart_items::instructions)),
                        cart_items::unit_price.eq(excluded(cart_items::unit_price)),
                        cart_items::updated_at.eq(diesel::dsl::now),
                    ))
                    .returning(CartItemEntity::as_returning())
                    .get_result(conn)
                    .await
                    .context("Failed to upsert cart item")?;

                if line.quantity > MAX_LINE_QUANTITY {
                    return Err(AppError::BadRequest(format!(
                        "At most {MAX_LINE_QUANTITY} of an item per order"
                    )));
                }

                touch_cart(conn, cart.id).await?;
                load_view(conn, cart).await
            })
        })
        .await?;

    Ok(StdResponse {
        data: Some(view),
        message: Some("Added item successfully"),
    })
}

#[derive(Deserialize, Validate, ToSchema, Debug)]
pub struct UpdateCartItemReq {
    /// `0` removes the line.
    #[validate(range(min = 0, max = 50))]
    pub quantity: i32,
    #[validate(length(max = 500))]
    pub instructions: Option<String>,
}

/// Change the quantity or instructions of a cart line.
#[utoipa::path(
    patch,
    path = "/items/{id}",
    tags = ["Cart"],
    security(("bearerAuth" = []), ("sessionId" = [])),
    params(
        ("id" = i32, Path, description = "Cart line ID")
    ),
    request_body = UpdateCartItemReq,
    responses(
        (status = 200, description = "Updated item successfully", body = StdResponse<CartView, String>),
        (status = 404, description = "Cart line not found")
    )
)]
async fn update_item(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Extension(viewer): Extension<Viewer>,
    Json(body): Json<UpdateCartItemReq>,
) -> Result<impl IntoResponse, AppError> {
    body.validate()?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let cart = find_cart(conn, &viewer).await?.ok_or(AppError::NotFound)?;
    let line = cart_items::table
        .find(id)
        .filter(cart_items::cart_id.eq(cart.id));

    if body.quantity == 0 {
        let deleted = diesel::delete(line)
            .execute(conn)
            .await
            .context("Failed to delete cart item")?;
        if deleted == 0 {
            return Err(AppError::NotFound);
        }
    } else {
        let _: CartItemEntity = diesel::update(line)
            .set((
                cart_items::quantity.eq(body.quantity),
                cart_items::instructions.eq(body.instructions),
                cart_items::updated_at.eq(diesel::dsl::now),
            ))
            .returning(CartItemEntity::as_returning())
            .get_result(conn)
            .await?;
    }

    touch_cart(conn, cart.id).await?;
    let view = load_view(conn, cart).await?;

    Ok(StdResponse {
        data: Some(view),
        message: Some("Updated item successfully"),
    })
}

/// Remove a line from the cart.
#[utoipa::path(
    delete,
    path = "/items/{id}",
    tags = ["Cart"],
    security(("bearerAuth" = []), ("sessionId" = [])),
    params(
        ("id" = i32, Path, description = "Cart line ID")
    ),
    responses(
        (status = 200, description = "Removed item successfully", body = StdResponse<CartView, String>),
        (status = 404, description = "Cart line not found")
    )
)]
async fn remove_item(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Extension(viewer): Extension<Viewer>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let cart = find_cart(conn, &viewer).await?.ok_or(AppError::NotFound)?;

    let deleted = diesel::delete(
        cart_items::table
            .find(id)
            .filter(cart_items::cart_id.eq(cart.id)),
    )
    .execute(conn)
    .await
    .context("Failed to delete cart item")?;

    if deleted == 0 {
        return Err(AppError::NotFound);
    }

    touch_cart(conn, cart.id).await?;
    let view = load_view(conn, cart).await?;

    Ok(StdResponse {
        data: Some(view),
        message: Some("Removed item successfully"),
    })
}

#[derive(Deserialize, Validate, ToSchema, Debug)]
pub struct MergeCartReq {
    #[validate(length(min = 8, max = 128))]
    pub session_id: String,
}

/// Move an anonymous session's cart into the signed-in user's cart.
#[utoipa::path(
    post,
    path = "/merge",
    tags = ["Cart"],
    security(("bearerAuth" = [])),
    request_body = MergeCartReq,
    responses(
        (status = 200, description = "Merged cart successfully", body = StdResponse<CartView, String>),
        (status = 401, description = "Only signed-in users can merge carts")
    )
)]
async fn merge_session_cart(
    State(state): State<AppState>,
    Extension(viewer): Extension<Viewer>,
    Json(body): Json<MergeCartReq>,
) -> Result<impl IntoResponse, AppError> {
    if !matches!(viewer, Viewer::User(_)) {
        return Err(AppError::Unauthorized(
            "Sign in to merge a guest cart".into(),
        ));
    }
    body.validate()?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let view = conn
        .transaction(move |conn| {
            Box::pin(async move {
                let user_cart = find_or_create_cart(conn, &viewer).await?;
                let guest = Viewer::Session(body.session_id);

                let Some(guest_cart) = find_cart(conn, &guest).await? else {
                    return load_view(conn, user_cart).await;
                };

                let existing: HashMap<i32, i32> = cart_items::table
                    .filter(cart_items::cart_id.eq(user_cart.id))
                    .select((cart_items::menu_item_id, cart_items::quantity))
                    .load::<(i32, i32)>(conn)
                    .await
                    .context("Failed to get cart items")?
                    .into_iter()
                    .collect();

                let guest_items: Vec<CartItemEntity> = cart_items::table
                    .filter(cart_items::cart_id.eq(guest_cart.id))
                    .select(CartItemEntity::as_select())
                    .load(conn)
                    .await
                    .context("Failed to get guest cart items")?;

                for item in guest_items {
                    let quantity = existing
                        .get(&item.menu_item_id)
                        .map_or(item.quantity, |current| current + item.quantity)
                        .min(MAX_LINE_QUANTITY);

                    diesel::insert_into(cart_items::table)
                        .values(CreateCartItemEntity {
                            cart_id: user_cart.id,
                            menu_item_id: item.menu_item_id,
                            quantity,
                            instructions: item.instructions,
                            unit_price: item.unit_price,
                        })
                        .on_conflict((cart_items::cart_id, cart_items::menu_item_id))
                        .do_update()
                        .set((
                            cart_items::quantity.eq(quantity),
                            cart_items::updated_at.eq(diesel::dsl::now),
                        ))
                        .execute(conn)
                        .await
                        .context("Failed to merge cart item")?;
                }

                diesel::delete(carts::table.find(guest_cart.id))
                    .execute(conn)
                    .await
                    .context("Failed to delete guest cart")?;

                touch_cart(conn, user_cart.id).await?;
                load_view(conn, user_cart).await
            })
        })
        .await?;

    Ok(StdResponse {
        data: Some(view),
        message: Some("Merged cart successfully"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_item_quantity_bounds() {
        let mut req = AddCartItemReq {
            menu_item_id: 1,
            quantity: 1,
            instructions: Some("Extra spicy".into()),
        };
        assert!(req.validate().is_ok());

        req.quantity = 0;
        assert!(req.validate().is_err());

        req.quantity = 51;
        let errors = req.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("quantity"));
    }

    #[test]
    fn instructions_are_bounded() {
        let req = AddCartItemReq {
            menu_item_id: 1,
            quantity: 2,
            instructions: Some("x".repeat(501)),
        };
        let errors = req.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("instructions"));
    }

    #[test]
    fn zero_quantity_update_is_allowed() {
        let req = UpdateCartItemReq {
            quantity: 0,
            instructions: None,
        };
        assert!(req.validate().is_ok());
    }
}
