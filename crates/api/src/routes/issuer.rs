//! Coupon and time-deal endpoints.

use std::sync::Arc;

use admission::{AdmissionError, QueueKey};
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::ProductId;
use issuer::{Coupon, CouponGrant, NewCoupon, NewTimeDeal, TimeDeal, TimeDealPurchase};
use serde::Deserialize;

use super::Actor;
use crate::error::ApiError;
use crate::state::AppState;

/// Queue event type that gates time-deal purchases.
pub const TIME_DEAL_QUEUE: &str = "timedeal";

#[derive(Deserialize)]
pub struct PurchaseRequest {
    pub product_id: i64,
    pub quantity: i64,
}

/// POST /coupons
pub async fn create_coupon(
    State(state): State<Arc<AppState>>,
    Json(new): Json<NewCoupon>,
) -> Result<(StatusCode, Json<Coupon>), ApiError> {
    let coupon = state.coupons.create_coupon(new).await?;
    Ok((StatusCode::CREATED, Json(coupon)))
}

/// GET /coupons/{id}
pub async fn get_coupon(
    State(state): State<Arc<AppState>>,
    Path(coupon_id): Path<i64>,
) -> Result<Json<Coupon>, ApiError> {
    Ok(Json(state.coupons.get_coupon(coupon_id).await?))
}

/// POST /coupons/{id}/issue: claim one unit of a limited coupon.
pub async fn issue_coupon(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path(coupon_id): Path<i64>,
) -> Result<(StatusCode, Json<CouponGrant>), ApiError> {
    let grant = state.coupons.issue(coupon_id, &actor).await?;
    Ok((StatusCode::CREATED, Json(grant)))
}

/// GET /coupons/grants: the caller's coupons.
pub async fn my_grants(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
) -> Json<Vec<CouponGrant>> {
    Json(state.coupons.grants_for(&actor).await)
}

/// POST /timedeals
pub async fn create_deal(
    State(state): State<Arc<AppState>>,
    Json(new): Json<NewTimeDeal>,
) -> Result<(StatusCode, Json<TimeDeal>), ApiError> {
    let deal = state.time_deals.create_deal(new).await?;
    Ok((StatusCode::CREATED, Json(deal)))
}

/// GET /timedeals/{id}
pub async fn get_deal(
    State(state): State<Arc<AppState>>,
    Path(deal_id): Path<i64>,
) -> Result<Json<TimeDeal>, ApiError> {
    Ok(Json(state.time_deals.get_deal(deal_id).await?))
}

/// POST /timedeals/{id}/start
pub async fn start_deal(
    State(state): State<Arc<AppState>>,
    Path(deal_id): Path<i64>,
) -> Result<Json<TimeDeal>, ApiError> {
    Ok(Json(state.time_deals.start(deal_id).await?))
}

/// POST /timedeals/{id}/purchase
///
/// When the deal has an active admission queue, only actors holding an
/// admitted entry get through.
#[tracing::instrument(skip(state, req))]
pub async fn purchase(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path(deal_id): Path<i64>,
    Json(req): Json<PurchaseRequest>,
) -> Result<(StatusCode, Json<TimeDealPurchase>), ApiError> {
    let key = QueueKey::new(TIME_DEAL_QUEUE, deal_id);
    if !state.admission.validate_entry(&key, &actor).await {
        return Err(AdmissionError::NotAdmitted(format!("{key} for {actor}")).into());
    }

    let purchase = state
        .time_deals
        .purchase(deal_id, ProductId::new(req.product_id), &actor, req.quantity)
        .await?;
    Ok((StatusCode::CREATED, Json(purchase)))
}
