//! Catalog seeding for operators: merchants, shoppers, products and coupons.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use common::{MerchantId, ProductId};
use domain::{Coupon, Discount, Merchant, MerchantConfig, Money, Product, Shopper};
use serde::Deserialize;
use store::{CatalogStore, Store};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateMerchantRequest {
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub config: MerchantConfig,
}

#[derive(Deserialize)]
pub struct CreateShopperRequest {
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateProductRequest {
    pub merchant_id: MerchantId,
    pub name: String,
    pub price: u32,
    pub stock: u32,
    pub image_url: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateCouponRequest {
    pub merchant_id: MerchantId,
    pub code: String,
    pub discount: Discount,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub product_scope: Vec<ProductId>,
}

/// POST /merchants
#[tracing::instrument(skip(state, req), fields(slug = %req.slug))]
pub async fn create_merchant<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<CreateMerchantRequest>,
) -> Result<(StatusCode, Json<Merchant>), ApiError> {
    if req.name.trim().is_empty() || req.slug.trim().is_empty() {
        return Err(ApiError::BadRequest("name and slug are required".to_string()));
    }
    let mut merchant = Merchant::new(req.name, req.slug);
    merchant.config = req.config;
    state.store.save_merchant(&merchant).await?;
    Ok((StatusCode::CREATED, Json(merchant)))
}

/// POST /shoppers
#[tracing::instrument(skip(state, req))]
pub async fn create_shopper<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<CreateShopperRequest>,
) -> Result<(StatusCode, Json<Shopper>), ApiError> {
    if req.phone.trim().is_empty() {
        return Err(ApiError::BadRequest("phone is required".to_string()));
    }
    let mut shopper = Shopper::new(req.name, req.phone);
    shopper.email = req.email;
    shopper.address = req.address;
    shopper.city = req.city;
    state.store.save_shopper(&shopper).await?;
    Ok((StatusCode::CREATED, Json(shopper)))
}

/// POST /products
#[tracing::instrument(skip(state, req), fields(merchant_id = %req.merchant_id))]
pub async fn create_product<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<CreateProductRequest>,
) -> Result<(StatusCode, Json<Product>), ApiError> {
    if req.price == 0 {
        return Err(ApiError::BadRequest("price must be positive".to_string()));
    }
    if state.store.get_merchant(req.merchant_id).await?.is_none() {
        return Err(ApiError::NotFound(format!(
            "Merchant {} not found",
            req.merchant_id
        )));
    }
    let mut product = Product::new(
        req.merchant_id,
        req.name,
        Money::new(i64::from(req.price)),
        req.stock,
    );
    product.image_url = req.image_url;
    state.store.save_product(&product).await?;
    Ok((StatusCode::CREATED, Json(product)))
}

/// POST /coupons
#[tracing::instrument(skip(state, req), fields(code = %req.code))]
pub async fn create_coupon<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<CreateCouponRequest>,
) -> Result<(StatusCode, Json<Coupon>), ApiError> {
    if req.code.trim().is_empty() {
        return Err(ApiError::BadRequest("code is required".to_string()));
    }
    let mut coupon = Coupon::new(req.merchant_id, req.code, req.discount);
    coupon.expires_at = req.expires_at;
    coupon.product_scope = req.product_scope;
    state.store.save_coupon(&coupon).await?;
    Ok((StatusCode::CREATED, Json(coupon)))
}
