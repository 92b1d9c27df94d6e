//! Cart lifecycle endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use checkout::{CartDisposition, OrderReceipt, RecoveryLink};
use common::{CartId, CartItemId, MerchantId, ProductId, ShopperId, VariantId};
use domain::{Cart, CartStatus, CartView, Money, TimeRemaining};
use serde::Deserialize;
use store::Store;

use super::parse_id;
use crate::error::ApiError;
use crate::state::AppState;

// -- Request types --

#[derive(Deserialize)]
pub struct CreateCartRequest {
    pub shopper_id: ShopperId,
    pub merchant_id: MerchantId,
    pub timeout_days: Option<u32>,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListCartsQuery {
    pub status: Option<String>,
}

#[derive(Deserialize)]
pub struct AddItemRequest {
    pub product_id: ProductId,
    pub quantity: u32,
    pub variant_id: Option<VariantId>,
}

#[derive(Deserialize)]
pub struct UpdateItemRequest {
    /// Zero or less removes the line.
    pub quantity: i64,
}

#[derive(Deserialize)]
pub struct ExtendRequest {
    pub additional_days: u32,
}

#[derive(Deserialize)]
pub struct ShippingRequest {
    pub shipping_cost: u32,
}

#[derive(Deserialize)]
pub struct ResumeQuery {
    pub token: String,
}

#[derive(Deserialize)]
pub struct CheckoutRequest {
    pub bank_code: String,
}

// -- Handlers --

/// POST /carts — return the shopper's ACTIVE cart or open a new one.
#[tracing::instrument(skip(state, req))]
pub async fn create<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<CreateCartRequest>,
) -> Result<(StatusCode, Json<Cart>), ApiError> {
    let cart = state
        .carts
        .create_cart(req.shopper_id, req.merchant_id, req.timeout_days, req.notes)
        .await?;
    Ok((StatusCode::CREATED, Json(cart)))
}

/// GET /carts?status= — list carts, optionally filtered by status.
#[tracing::instrument(skip(state))]
pub async fn list<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Query(query): Query<ListCartsQuery>,
) -> Result<Json<Vec<Cart>>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<CartStatus>)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    Ok(Json(state.carts.list_carts(status).await?))
}

/// GET /carts/:id — a cart with its lines.
#[tracing::instrument(skip(state))]
pub async fn get<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<CartView>, ApiError> {
    let cart_id: CartId = parse_id(&id)?;
    Ok(Json(state.carts.get_cart(cart_id).await?))
}

/// GET /shoppers/:shopper/merchants/:merchant/cart — the shopper's open cart.
#[tracing::instrument(skip(state))]
pub async fn open_cart<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Path((shopper, merchant)): Path<(String, String)>,
) -> Result<Json<CartView>, ApiError> {
    let shopper_id: ShopperId = parse_id(&shopper)?;
    let merchant_id: MerchantId = parse_id(&merchant)?;
    let view = state
        .carts
        .get_open_cart(shopper_id, merchant_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No open cart for shopper {shopper}")))?;
    Ok(Json(view))
}

/// POST /carts/:id/items — reserve stock and add a line.
#[tracing::instrument(skip(state, req))]
pub async fn add_item<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    Json(req): Json<AddItemRequest>,
) -> Result<Json<CartView>, ApiError> {
    let cart_id: CartId = parse_id(&id)?;
    let view = state
        .carts
        .add_item(cart_id, req.product_id, req.quantity, req.variant_id)
        .await?;
    Ok(Json(view))
}

/// PUT /cart-items/:id — change a line's quantity.
#[tracing::instrument(skip(state, req))]
pub async fn update_item<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateItemRequest>,
) -> Result<Json<CartView>, ApiError> {
    let item_id: CartItemId = parse_id(&id)?;
    let view = state
        .carts
        .update_item_quantity(item_id, req.quantity)
        .await?;
    Ok(Json(view))
}

/// DELETE /cart-items/:id — remove a line and release its stock.
#[tracing::instrument(skip(state))]
pub async fn remove_item<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<CartView>, ApiError> {
    let item_id: CartItemId = parse_id(&id)?;
    Ok(Json(state.carts.remove_item(item_id).await?))
}

/// POST /carts/:id/expire — expire now, releasing the hold.
#[tracing::instrument(skip(state))]
pub async fn expire<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<Cart>, ApiError> {
    let cart_id: CartId = parse_id(&id)?;
    Ok(Json(state.carts.expire(cart_id).await?))
}

/// POST /carts/:id/cancel — abandon an ACTIVE cart.
#[tracing::instrument(skip(state))]
pub async fn cancel<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<Cart>, ApiError> {
    let cart_id: CartId = parse_id(&id)?;
    Ok(Json(state.carts.cancel(cart_id).await?))
}

/// PUT /carts/:id/extend — push the deadline forward.
#[tracing::instrument(skip(state, req))]
pub async fn extend<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    Json(req): Json<ExtendRequest>,
) -> Result<Json<Cart>, ApiError> {
    let cart_id: CartId = parse_id(&id)?;
    let cart = state
        .carts
        .extend_deadline(cart_id, req.additional_days)
        .await?;
    Ok(Json(cart))
}

/// PUT /carts/:id/shipping — set the shipping cost.
#[tracing::instrument(skip(state, req))]
pub async fn update_shipping<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    Json(req): Json<ShippingRequest>,
) -> Result<Json<CartView>, ApiError> {
    let cart_id: CartId = parse_id(&id)?;
    let view = state
        .carts
        .update_shipping(cart_id, Money::new(i64::from(req.shipping_cost)))
        .await?;
    Ok(Json(view))
}

/// GET /carts/:id/time-remaining
#[tracing::instrument(skip(state))]
pub async fn time_remaining<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<TimeRemaining>, ApiError> {
    let cart_id: CartId = parse_id(&id)?;
    Ok(Json(state.carts.time_remaining(cart_id).await?))
}

/// POST /carts/:id/recovery-link — issue a signed link back to the cart.
#[tracing::instrument(skip(state))]
pub async fn recovery_link<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<RecoveryLink>, ApiError> {
    let cart_id: CartId = parse_id(&id)?;
    Ok(Json(state.carts.generate_recovery_link(cart_id).await?))
}

/// GET /carts/:id/resume?token= — open an expired cart from its recovery link.
#[tracing::instrument(skip(state, query))]
pub async fn resume<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    Query(query): Query<ResumeQuery>,
) -> Result<Json<CartView>, ApiError> {
    let cart_id: CartId = parse_id(&id)?;
    let view = state.carts.resume_with_token(cart_id, &query.token).await?;
    Ok(Json(view))
}

/// POST /carts/:id/checkout — order the lines of an expired cart.
#[tracing::instrument(skip(state, req))]
pub async fn checkout<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    Json(req): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<OrderReceipt>), ApiError> {
    let cart_id: CartId = parse_id(&id)?;
    let receipt = state
        .settlement
        .create_order_from_expired_cart(cart_id, req.bank_code)
        .await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

/// POST /carts/:id/process — run expiry handling for one cart now.
#[tracing::instrument(skip(state))]
pub async fn process<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<CartDisposition>, ApiError> {
    let cart_id: CartId = parse_id(&id)?;
    Ok(Json(state.scheduler.process_cart(cart_id).await?))
}
