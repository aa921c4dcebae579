//! In-process ledger for single-node deployments and tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use common::{ActorId, ProductId};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, broadcast};

use crate::batch::StockBatch;
use crate::error::{InventoryError, Result};
use crate::ledger::{
    InventoryLedger, InventoryUpdate, LedgerConfig, StockOperation, plan_batch, record_outcome,
};
use crate::movement::{MovementContext, MovementKind, StockMovement};
use crate::record::InventoryRecord;

type Slot = Arc<Mutex<InventoryRecord>>;

/// Ledger backed by a map of per-product mutexes.
///
/// A product's mutex plays the role of a row lock: it is held from the
/// read of the record until its new value is written back. Batches take
/// the mutexes in ascending product order with a shared deadline.
#[derive(Clone)]
pub struct InMemoryInventoryLedger {
    slots: Arc<RwLock<HashMap<ProductId, Slot>>>,
    movements: Arc<RwLock<Vec<StockMovement>>>,
    updates: broadcast::Sender<InventoryUpdate>,
    config: LedgerConfig,
}

impl Default for InMemoryInventoryLedger {
    fn default() -> Self {
        Self::new(LedgerConfig::default())
    }
}

impl InMemoryInventoryLedger {
    pub fn new(config: LedgerConfig) -> Self {
        let (updates, _) = broadcast::channel(config.update_buffer);
        Self {
            slots: Arc::new(RwLock::new(HashMap::new())),
            movements: Arc::new(RwLock::new(Vec::new())),
            updates,
            config,
        }
    }

    /// Returns the total number of movements written.
    pub async fn movement_count(&self) -> usize {
        self.movements.read().await.len()
    }

    async fn slots_for(&self, product_ids: &[ProductId]) -> Result<Vec<Slot>> {
        let slots = self.slots.read().await;
        product_ids
            .iter()
            .map(|id| {
                slots
                    .get(id)
                    .cloned()
                    .ok_or(InventoryError::NotFound { product_id: *id })
            })
            .collect()
    }

    /// Locks the given slots in order, failing if the deadline passes.
    async fn lock_in_order(
        &self,
        product_ids: &[ProductId],
        slots: Vec<Slot>,
    ) -> Result<Vec<OwnedMutexGuard<InventoryRecord>>> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.config.lock_timeout;
        let mut guards = Vec::with_capacity(slots.len());
        for (product_id, slot) in product_ids.iter().zip(slots) {
            match tokio::time::timeout_at(deadline, slot.lock_owned()).await {
                Ok(guard) => guards.push(guard),
                Err(_) => {
                    tracing::warn!(%product_id, "inventory lock wait timed out");
                    return Err(InventoryError::LockTimeout {
                        product_id: *product_id,
                        waited_ms: started.elapsed().as_millis() as u64,
                    });
                }
            }
        }
        metrics::histogram!("inventory_lock_wait_seconds").record(started.elapsed().as_secs_f64());
        Ok(guards)
    }

    async fn append_movements(&self, planned: Vec<StockMovement>) {
        let mut log = self.movements.write().await;
        for mut movement in planned {
            movement.id = log.len() as i64 + 1;
            log.push(movement);
        }
    }

    fn broadcast(&self, record: &InventoryRecord) {
        // No receivers is fine; updates are best-effort.
        let _ = self.updates.send(InventoryUpdate::from(record));
    }

    async fn apply_locked(
        &self,
        op: StockOperation,
        batch: &StockBatch,
        ctx: &MovementContext,
    ) -> Result<Vec<InventoryRecord>> {
        batch.validate()?;
        let product_ids = batch.product_ids();
        let slots = self.slots_for(&product_ids).await?;
        let mut guards = self.lock_in_order(&product_ids, slots).await?;

        let current: Vec<InventoryRecord> = guards.iter().map(|g| (**g).clone()).collect();
        let planned = plan_batch(op, &current, batch, ctx)?;

        let mut records = Vec::with_capacity(planned.len());
        let mut movements = Vec::with_capacity(planned.len());
        for (guard, (after, movement)) in guards.iter_mut().zip(planned) {
            **guard = after.clone();
            records.push(after);
            movements.push(movement);
        }
        self.append_movements(movements).await;
        drop(guards);

        for record in &records {
            self.broadcast(record);
        }
        Ok(records)
    }
}

#[async_trait]
impl InventoryLedger for InMemoryInventoryLedger {
    #[tracing::instrument(skip(self))]
    async fn initialize(
        &self,
        product_id: ProductId,
        quantity: i64,
        actor: &ActorId,
    ) -> Result<InventoryRecord> {
        let record = InventoryRecord::initial(product_id, quantity)?;
        {
            let mut slots = self.slots.write().await;
            if slots.contains_key(&product_id) {
                return Err(InventoryError::AlreadyInitialized { product_id });
            }
            slots.insert(product_id, Arc::new(Mutex::new(record.clone())));
        }

        let ctx = MovementContext {
            actor: actor.clone(),
            ..MovementContext::system("initial stock")
        };
        let empty = InventoryRecord {
            available: 0,
            total: 0,
            ..record.clone()
        };
        self.append_movements(vec![StockMovement::between(
            &empty,
            &record,
            MovementKind::Initial,
            quantity,
            &ctx,
        )])
        .await;

        tracing::info!(%product_id, quantity, "inventory initialized");
        self.broadcast(&record);
        Ok(record)
    }

    #[tracing::instrument(skip_all, fields(op = op.as_str(), products = batch.len()))]
    async fn apply(
        &self,
        op: StockOperation,
        batch: &StockBatch,
        ctx: &MovementContext,
    ) -> Result<Vec<InventoryRecord>> {
        let result = self.apply_locked(op, batch, ctx).await;
        record_outcome(op.as_str(), &result);
        if let Err(e) = &result {
            tracing::info!(error = %e, "inventory batch rejected");
        }
        result
    }

    #[tracing::instrument(skip(self, ctx))]
    async fn adjust(
        &self,
        product_id: ProductId,
        available: i64,
        reserved: i64,
        ctx: &MovementContext,
    ) -> Result<InventoryRecord> {
        let slots = self.slots_for(&[product_id]).await?;
        let mut guards = self.lock_in_order(&[product_id], slots).await?;
        let guard = &mut guards[0];

        let before = (**guard).clone();
        let mut after = before.clone();
        after.adjust(available, reserved)?;
        let movement = StockMovement::between(
            &before,
            &after,
            MovementKind::Adjustment,
            after.total - before.total,
            ctx,
        );
        **guard = after.clone();
        self.append_movements(vec![movement]).await;
        drop(guards);

        tracing::info!(%product_id, available, reserved, "inventory adjusted");
        self.broadcast(&after);
        Ok(after)
    }

    async fn get_inventory(&self, product_id: ProductId) -> Result<InventoryRecord> {
        let slot = self
            .slots
            .read()
            .await
            .get(&product_id)
            .cloned()
            .ok_or(InventoryError::NotFound { product_id })?;
        let record = slot.lock().await.clone();
        Ok(record)
    }

    async fn movements(
        &self,
        product_id: ProductId,
        page: u32,
        size: u32,
    ) -> Result<Vec<StockMovement>> {
        let log = self.movements.read().await;
        Ok(log
            .iter()
            .rev()
            .filter(|m| m.product_id == product_id)
            .skip(page as usize * size as usize)
            .take(size as usize)
            .cloned()
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<InventoryUpdate> {
        self.updates.subscribe()
    }
}
