//! Order and payment endpoints driving the saga.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::{Money, ProductId};
use saga::{Order, OrderItem, Payment, PaymentMethod, ShippingInfo};
use serde::Deserialize;

use super::Actor;
use crate::error::ApiError;
use crate::state::AppState;

// -- Request types --

#[derive(Deserialize)]
pub struct CreateOrderRequest {
    pub items: Vec<OrderItemRequest>,
    #[serde(default)]
    pub shipping: ShippingInfo,
}

#[derive(Deserialize)]
pub struct OrderItemRequest {
    pub product_id: i64,
    pub product_name: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

#[derive(Deserialize)]
pub struct CancelOrderRequest {
    pub reason: Option<String>,
}

#[derive(Deserialize)]
pub struct PaymentRequest {
    pub order_number: String,
    pub method: PaymentMethod,
    /// Coupon grant to redeem against this order.
    pub coupon_grant_id: Option<i64>,
}

// -- Handlers --

/// POST /orders: create an order and reserve its stock.
#[tracing::instrument(skip(state, req))]
pub async fn create(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Json(req): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<Order>), ApiError> {
    let items = req
        .items
        .into_iter()
        .map(|item| {
            OrderItem::new(
                ProductId::new(item.product_id),
                item.product_name,
                Money::from_cents(item.unit_price_cents),
                item.quantity,
            )
        })
        .collect();
    let order = state.saga.create_order(&actor, req.shipping, items).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

/// GET /orders/{number}
pub async fn get(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path(order_number): Path<String>,
) -> Result<Json<Order>, ApiError> {
    let order = state.saga.get_order_for(&actor, &order_number).await?;
    Ok(Json(order))
}

/// POST /orders/{number}/cancel
#[tracing::instrument(skip(state, req))]
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path(order_number): Path<String>,
    Json(req): Json<CancelOrderRequest>,
) -> Result<Json<Order>, ApiError> {
    let reason = req
        .reason
        .unwrap_or_else(|| "cancelled by customer".to_string());
    let order = state
        .saga
        .cancel_order(&actor, &order_number, &reason)
        .await?;
    Ok(Json(order))
}

/// POST /payments: charge a confirmed order, optionally with a coupon.
///
/// The coupon grant is claimed for the order before the charge, so no
/// other payment can redeem it meanwhile. If the payment fails the grant
/// is handed back and the order keeps no discount.
#[tracing::instrument(skip(state, req), fields(order_number = %req.order_number))]
pub async fn pay(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Json(req): Json<PaymentRequest>,
) -> Result<Json<Payment>, ApiError> {
    let Some(grant_id) = req.coupon_grant_id else {
        let payment = state
            .saga
            .process_payment(&actor, &req.order_number, req.method)
            .await?;
        return Ok(Json(payment));
    };

    let order = state.saga.get_order_for(&actor, &req.order_number).await?;
    let discount = state
        .coupons
        .claim_grant(grant_id, &actor, &req.order_number, order.total_amount)
        .await?;

    match state
        .saga
        .process_discounted_payment(&actor, &req.order_number, req.method, Some(discount))
        .await
    {
        Ok(payment) => Ok(Json(payment)),
        Err(e) => {
            if let Err(release_err) = state
                .coupons
                .release_grant(grant_id, &req.order_number)
                .await
            {
                tracing::error!(
                    grant_id,
                    error = %release_err,
                    "could not hand back coupon grant after failed payment"
                );
            }
            Err(e.into())
        }
    }
}
