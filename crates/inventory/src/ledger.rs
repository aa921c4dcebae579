//! The ledger trait and the batch planning shared by its back-ends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{ActorId, ProductId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::batch::StockBatch;
use crate::error::{InventoryError, Result};
use crate::movement::{MovementContext, MovementKind, StockMovement};
use crate::record::InventoryRecord;

/// Ledger tunables.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// How long a batch may wait for a competing holder to release a
    /// product lock before failing with [`InventoryError::LockTimeout`].
    pub lock_timeout: Duration,
    /// Capacity of the inventory update broadcast channel.
    pub update_buffer: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(3),
            update_buffer: 256,
        }
    }
}

/// The batch mutations a ledger supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StockOperation {
    Reserve,
    Deduct,
    Release,
    Inbound,
    Return,
}

impl StockOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StockOperation::Reserve => "reserve",
            StockOperation::Deduct => "deduct",
            StockOperation::Release => "release",
            StockOperation::Inbound => "add",
            StockOperation::Return => "return",
        }
    }

    pub fn movement_kind(&self) -> MovementKind {
        match self {
            StockOperation::Reserve => MovementKind::Reserve,
            StockOperation::Deduct => MovementKind::Deduct,
            StockOperation::Release => MovementKind::Release,
            StockOperation::Inbound => MovementKind::Inbound,
            StockOperation::Return => MovementKind::Return,
        }
    }

    fn apply_to(&self, record: &mut InventoryRecord, quantity: i64) -> Result<()> {
        match self {
            StockOperation::Reserve => record.reserve(quantity),
            StockOperation::Deduct => record.deduct(quantity),
            StockOperation::Release => record.release(quantity),
            StockOperation::Inbound | StockOperation::Return => record.add(quantity),
        }
    }
}

/// Stock levels pushed to subscribers after each committed change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryUpdate {
    pub product_id: ProductId,
    pub available: i64,
    pub reserved: i64,
    pub total: i64,
    pub at: DateTime<Utc>,
}

impl From<&InventoryRecord> for InventoryUpdate {
    fn from(record: &InventoryRecord) -> Self {
        Self {
            product_id: record.product_id,
            available: record.available,
            reserved: record.reserved,
            total: record.total,
            at: record.updated_at,
        }
    }
}

/// Computes the post-operation records and their movements for a batch,
/// without touching the originals.
///
/// `locked` must hold the current records of exactly the batch's products.
/// Fails on the first product whose precondition does not hold, in which
/// case the caller commits nothing.
pub(crate) fn plan_batch(
    op: StockOperation,
    locked: &[InventoryRecord],
    batch: &StockBatch,
    ctx: &MovementContext,
) -> Result<Vec<(InventoryRecord, StockMovement)>> {
    let mut planned = Vec::with_capacity(locked.len());
    for before in locked {
        let quantity = batch
            .quantity(before.product_id)
            .ok_or(InventoryError::NotFound {
                product_id: before.product_id,
            })?;
        let mut after = before.clone();
        op.apply_to(&mut after, quantity)?;
        let movement = StockMovement::between(before, &after, op.movement_kind(), quantity, ctx);
        planned.push((after, movement));
    }
    Ok(planned)
}

pub(crate) fn record_outcome<T>(op: &'static str, result: &Result<T>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.kind().as_str(),
    };
    metrics::counter!("inventory_operations_total", "op" => op, "outcome" => outcome).increment(1);
}

/// Per-product stock ledger.
///
/// Batch operations lock every product in the batch in ascending id order
/// before reading or writing any of them, and either apply to all
/// products or to none.
#[async_trait]
pub trait InventoryLedger: Send + Sync {
    /// Creates the record for a product. Each product is initialized once.
    async fn initialize(
        &self,
        product_id: ProductId,
        quantity: i64,
        actor: &ActorId,
    ) -> Result<InventoryRecord>;

    /// Applies one batch operation atomically.
    async fn apply(
        &self,
        op: StockOperation,
        batch: &StockBatch,
        ctx: &MovementContext,
    ) -> Result<Vec<InventoryRecord>>;

    /// Admin correction of one product's counters.
    async fn adjust(
        &self,
        product_id: ProductId,
        available: i64,
        reserved: i64,
        ctx: &MovementContext,
    ) -> Result<InventoryRecord>;

    async fn get_inventory(&self, product_id: ProductId) -> Result<InventoryRecord>;

    /// Returns one page of a product's movements, newest first.
    async fn movements(
        &self,
        product_id: ProductId,
        page: u32,
        size: u32,
    ) -> Result<Vec<StockMovement>>;

    /// Subscribes to committed stock level changes.
    fn subscribe(&self) -> broadcast::Receiver<InventoryUpdate>;

    async fn reserve(
        &self,
        batch: &StockBatch,
        ctx: &MovementContext,
    ) -> Result<Vec<InventoryRecord>> {
        self.apply(StockOperation::Reserve, batch, ctx).await
    }

    async fn deduct(
        &self,
        batch: &StockBatch,
        ctx: &MovementContext,
    ) -> Result<Vec<InventoryRecord>> {
        self.apply(StockOperation::Deduct, batch, ctx).await
    }

    async fn release(
        &self,
        batch: &StockBatch,
        ctx: &MovementContext,
    ) -> Result<Vec<InventoryRecord>> {
        self.apply(StockOperation::Release, batch, ctx).await
    }

    async fn add(&self, batch: &StockBatch, ctx: &MovementContext) -> Result<Vec<InventoryRecord>> {
        self.apply(StockOperation::Inbound, batch, ctx).await
    }

    async fn return_stock(
        &self,
        batch: &StockBatch,
        ctx: &MovementContext,
    ) -> Result<Vec<InventoryRecord>> {
        self.apply(StockOperation::Return, batch, ctx).await
    }
}

#[async_trait]
impl<T: InventoryLedger + ?Sized> InventoryLedger for Arc<T> {
    async fn initialize(
        &self,
        product_id: ProductId,
        quantity: i64,
        actor: &ActorId,
    ) -> Result<InventoryRecord> {
        (**self).initialize(product_id, quantity, actor).await
    }

    async fn apply(
        &self,
        op: StockOperation,
        batch: &StockBatch,
        ctx: &MovementContext,
    ) -> Result<Vec<InventoryRecord>> {
        (**self).apply(op, batch, ctx).await
    }

    async fn adjust(
        &self,
        product_id: ProductId,
        available: i64,
        reserved: i64,
        ctx: &MovementContext,
    ) -> Result<InventoryRecord> {
        (**self).adjust(product_id, available, reserved, ctx).await
    }

    async fn get_inventory(&self, product_id: ProductId) -> Result<InventoryRecord> {
        (**self).get_inventory(product_id).await
    }

    async fn movements(
        &self,
        product_id: ProductId,
        page: u32,
        size: u32,
    ) -> Result<Vec<StockMovement>> {
        (**self).movements(product_id, page, size).await
    }

    fn subscribe(&self) -> broadcast::Receiver<InventoryUpdate> {
        (**self).subscribe()
    }
}
