//! Order creation, lookup and stock rollback endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use checkout::{CreateOrder, OrderReceipt};
use common::{CartId, MerchantId, OrderId, ProductId, ShopperId, VariantId};
use domain::{Money, Order, OrderLine};
use serde::{Deserialize, Serialize};
use store::Store;

use super::parse_id;
use crate::error::ApiError;
use crate::state::AppState;

// -- Request types --

#[derive(Deserialize)]
pub struct CreateOrderRequest {
    pub shopper_id: ShopperId,
    pub merchant_id: MerchantId,
    pub lines: Vec<OrderLineRequest>,
    #[serde(default)]
    pub shipping_cost: u32,
    pub coupon_code: Option<String>,
    pub cart_id: Option<CartId>,
    pub bank_code: String,
    pub carrier: Option<String>,
}

#[derive(Deserialize)]
pub struct OrderLineRequest {
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub quantity: u32,
    pub unit_price: u32,
}

impl From<OrderLineRequest> for OrderLine {
    fn from(req: OrderLineRequest) -> Self {
        OrderLine {
            product_id: req.product_id,
            variant_id: req.variant_id,
            quantity: req.quantity,
            unit_price: Money::new(i64::from(req.unit_price)),
        }
    }
}

// -- Response types --

#[derive(Serialize)]
pub struct RollbackResponse {
    pub order_id: OrderId,
    pub restored_units: u32,
}

// -- Handlers --

/// POST /orders — reserve stock, persist the order and open the charge.
#[tracing::instrument(skip(state, req))]
pub async fn create<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<OrderReceipt>), ApiError> {
    let request = CreateOrder {
        shopper_id: req.shopper_id,
        merchant_id: req.merchant_id,
        lines: req.lines.into_iter().map(OrderLine::from).collect(),
        shipping_cost: Money::new(i64::from(req.shipping_cost)),
        coupon_code: req.coupon_code,
        originating_cart: req.cart_id,
        bank_code: req.bank_code,
        carrier: req.carrier,
    };
    let receipt = state.settlement.create_order(request).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

/// GET /orders/:id — an order with its lines.
#[tracing::instrument(skip(state))]
pub async fn get<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<Order>, ApiError> {
    let order_id: OrderId = parse_id(&id)?;
    Ok(Json(state.settlement.get_order(order_id).await?))
}

/// POST /orders/:id/rollback — return reserved units to stock.
#[tracing::instrument(skip(state))]
pub async fn rollback<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<RollbackResponse>, ApiError> {
    let order_id: OrderId = parse_id(&id)?;
    let restored_units = state.settlement.rollback_stock(order_id).await?;
    Ok(Json(RollbackResponse {
        order_id,
        restored_units,
    }))
}
