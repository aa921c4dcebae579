//! Stock administration and audit endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use common::ProductId;
use inventory::{InventoryRecord, MovementContext, StockBatch, StockMovement};
use serde::Deserialize;

use super::Actor;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct InitializeRequest {
    pub product_id: i64,
    pub quantity: i64,
}

#[derive(Deserialize)]
pub struct StockLine {
    pub product_id: i64,
    pub quantity: i64,
}

#[derive(Deserialize)]
pub struct AddStockRequest {
    pub items: Vec<StockLine>,
    pub reason: Option<String>,
}

#[derive(Deserialize)]
pub struct MovementsQuery {
    #[serde(default)]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub size: u32,
}

fn default_page_size() -> u32 {
    20
}

/// POST /inventory: create a product's stock record.
#[tracing::instrument(skip(state, req), fields(product_id = req.product_id))]
pub async fn initialize(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Json(req): Json<InitializeRequest>,
) -> Result<(StatusCode, Json<InventoryRecord>), ApiError> {
    let record = state
        .ledger
        .initialize(ProductId::new(req.product_id), req.quantity, &actor)
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// GET /inventory/{id}
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(product_id): Path<i64>,
) -> Result<Json<InventoryRecord>, ApiError> {
    let record = state.ledger.get_inventory(ProductId::new(product_id)).await?;
    Ok(Json(record))
}

/// POST /inventory/add: restock several products at once.
#[tracing::instrument(skip(state, req))]
pub async fn add(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Json(req): Json<AddStockRequest>,
) -> Result<Json<Vec<InventoryRecord>>, ApiError> {
    let mut batch = StockBatch::new();
    for line in &req.items {
        batch.add(ProductId::new(line.product_id), line.quantity);
    }
    let reason = req.reason.unwrap_or_else(|| "restock".to_string());
    let records = state
        .ledger
        .add(&batch, &MovementContext::admin(actor, reason))
        .await?;
    Ok(Json(records))
}

/// GET /inventory/{id}/movements?page=&size=
pub async fn movements(
    State(state): State<Arc<AppState>>,
    Path(product_id): Path<i64>,
    Query(query): Query<MovementsQuery>,
) -> Result<Json<Vec<StockMovement>>, ApiError> {
    if query.size == 0 || query.size > 100 {
        return Err(ApiError::BadRequest(
            "size must be between 1 and 100".to_string(),
        ));
    }
    let movements = state
        .ledger
        .movements(ProductId::new(product_id), query.page, query.size)
        .await?;
    Ok(Json(movements))
}
