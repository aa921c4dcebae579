use std::time::Instant;

use async_trait::async_trait;
use common::{ActorId, ProductId};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::sync::broadcast;

use crate::batch::StockBatch;
use crate::error::{InventoryError, Result};
use crate::ledger::{
    InventoryLedger, InventoryUpdate, LedgerConfig, StockOperation, plan_batch, record_outcome,
};
use crate::movement::{MovementContext, MovementKind, StockMovement};
use crate::record::InventoryRecord;

/// SQLSTATE raised when `lock_timeout` expires.
const LOCK_NOT_AVAILABLE: &str = "55P03";

const SELECT_COLUMNS: &str = "product_id, available_quantity, reserved_quantity, total_quantity, version, updated_at";

/// PostgreSQL-backed inventory ledger.
///
/// Each batch runs in one transaction: `SELECT ... ORDER BY product_id FOR UPDATE`
/// takes the row locks in ascending order, `lock_timeout` bounds the wait,
/// and every `UPDATE` additionally checks the version it read.
#[derive(Clone)]
pub struct PostgresInventoryLedger {
    pool: PgPool,
    updates: broadcast::Sender<InventoryUpdate>,
    config: LedgerConfig,
}

impl PostgresInventoryLedger {
    /// Creates a new PostgreSQL ledger.
    pub fn new(pool: PgPool, config: LedgerConfig) -> Self {
        let (updates, _) = broadcast::channel(config.update_buffer);
        Self {
            pool,
            updates,
            config,
        }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_record(row: &PgRow) -> Result<InventoryRecord> {
        Ok(InventoryRecord {
            product_id: ProductId::new(row.try_get("product_id")?),
            available: row.try_get("available_quantity")?,
            reserved: row.try_get("reserved_quantity")?,
            total: row.try_get("total_quantity")?,
            version: row.try_get("version")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_movement(row: &PgRow) -> Result<StockMovement> {
        let kind: String = row.try_get("movement_type")?;
        let reference_type: String = row.try_get("reference_type")?;
        let performed_by: String = row.try_get("performed_by")?;
        Ok(StockMovement {
            id: row.try_get("id")?,
            product_id: ProductId::new(row.try_get("product_id")?),
            kind: kind.parse().map_err(decode_error)?,
            quantity: row.try_get("quantity")?,
            previous_available: row.try_get("previous_available")?,
            after_available: row.try_get("after_available")?,
            previous_reserved: row.try_get("previous_reserved")?,
            after_reserved: row.try_get("after_reserved")?,
            reference_type: reference_type.parse().map_err(decode_error)?,
            reference_id: row.try_get("reference_id")?,
            reason: row.try_get("reason")?,
            performed_by: ActorId::new(performed_by),
            created_at: row.try_get("created_at")?,
        })
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await?;
        // SET does not take bind parameters; the value is an integer we own.
        let timeout_ms = self.config.lock_timeout.as_millis();
        sqlx::query(&format!("SET LOCAL lock_timeout = '{timeout_ms}ms'"))
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    async fn lock_rows(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        product_ids: &[ProductId],
    ) -> Result<Vec<InventoryRecord>> {
        let started = Instant::now();
        let ids: Vec<i64> = product_ids.iter().map(ProductId::value).collect();
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM inventory WHERE product_id = ANY($1) \
             ORDER BY product_id FOR UPDATE"
        ))
        .bind(&ids)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| lock_error(e, product_ids[0], started))?;
        metrics::histogram!("inventory_lock_wait_seconds").record(started.elapsed().as_secs_f64());

        let records = rows
            .iter()
            .map(Self::row_to_record)
            .collect::<Result<Vec<_>>>()?;
        if records.len() != product_ids.len() {
            let missing = product_ids
                .iter()
                .find(|id| !records.iter().any(|r| r.product_id == **id))
                .copied()
                .unwrap_or(product_ids[0]);
            return Err(InventoryError::NotFound {
                product_id: missing,
            });
        }
        Ok(records)
    }

    async fn write_record(
        tx: &mut Transaction<'static, Postgres>,
        before: &InventoryRecord,
        after: &InventoryRecord,
    ) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE inventory SET available_quantity = $1, reserved_quantity = $2, \
             total_quantity = $3, version = $4, updated_at = $5 \
             WHERE product_id = $6 AND version = $7",
        )
        .bind(after.available)
        .bind(after.reserved)
        .bind(after.total)
        .bind(after.version)
        .bind(after.updated_at)
        .bind(after.product_id.value())
        .bind(before.version)
        .execute(&mut **tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(InventoryError::VersionConflict {
                product_id: before.product_id,
                expected: before.version,
            });
        }
        Ok(())
    }

    async fn insert_movement(
        tx: &mut Transaction<'static, Postgres>,
        movement: &StockMovement,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO stock_movements (product_id, movement_type, quantity, \
             previous_available, after_available, previous_reserved, after_reserved, \
             reference_type, reference_id, reason, performed_by, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(movement.product_id.value())
        .bind(movement.kind.as_str())
        .bind(movement.quantity)
        .bind(movement.previous_available)
        .bind(movement.after_available)
        .bind(movement.previous_reserved)
        .bind(movement.after_reserved)
        .bind(movement.reference_type.as_str())
        .bind(&movement.reference_id)
        .bind(&movement.reason)
        .bind(movement.performed_by.as_str())
        .bind(movement.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    fn broadcast(&self, record: &InventoryRecord) {
        let _ = self.updates.send(InventoryUpdate::from(record));
    }

    async fn apply_in_tx(
        &self,
        op: StockOperation,
        batch: &StockBatch,
        ctx: &MovementContext,
    ) -> Result<Vec<InventoryRecord>> {
        batch.validate()?;
        let product_ids = batch.product_ids();

        let mut tx = self.begin().await?;
        let current = self.lock_rows(&mut tx, &product_ids).await?;
        let planned = plan_batch(op, &current, batch, ctx)?;

        for (before, (after, movement)) in current.iter().zip(&planned) {
            Self::write_record(&mut tx, before, after).await?;
            Self::insert_movement(&mut tx, movement).await?;
        }
        tx.commit().await?;

        let records: Vec<InventoryRecord> = planned.into_iter().map(|(after, _)| after).collect();
        for record in &records {
            self.broadcast(record);
        }
        Ok(records)
    }
}

fn decode_error(message: String) -> InventoryError {
    InventoryError::Database(sqlx::Error::Decode(message.into()))
}

fn lock_error(err: sqlx::Error, product_id: ProductId, started: Instant) -> InventoryError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some(LOCK_NOT_AVAILABLE) {
            tracing::warn!(%product_id, "inventory row lock wait timed out");
            return InventoryError::LockTimeout {
                product_id,
                waited_ms: started.elapsed().as_millis() as u64,
            };
        }
    }
    InventoryError::Database(err)
}

#[async_trait]
impl InventoryLedger for PostgresInventoryLedger {
    #[tracing::instrument(skip(self))]
    async fn initialize(
        &self,
        product_id: ProductId,
        quantity: i64,
        actor: &ActorId,
    ) -> Result<InventoryRecord> {
        let record = InventoryRecord::initial(product_id, quantity)?;
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO inventory (product_id, available_quantity, reserved_quantity, \
             total_quantity, version, updated_at) VALUES ($1, $2, 0, $2, 0, $3)",
        )
        .bind(product_id.value())
        .bind(quantity)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await;

        if let Err(sqlx::Error::Database(db_err)) = &inserted {
            if db_err.is_unique_violation() {
                return Err(InventoryError::AlreadyInitialized { product_id });
            }
        }
        inserted?;

        let ctx = MovementContext {
            actor: actor.clone(),
            ..MovementContext::system("initial stock")
        };
        let empty = InventoryRecord {
            available: 0,
            total: 0,
            ..record.clone()
        };
        let movement =
            StockMovement::between(&empty, &record, MovementKind::Initial, quantity, &ctx);
        Self::insert_movement(&mut tx, &movement).await?;
        tx.commit().await?;

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
        let result = self.apply_in_tx(op, batch, ctx).await;
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
        let mut tx = self.begin().await?;
        let before = self
            .lock_rows(&mut tx, &[product_id])
            .await?
            .remove(0);
        let mut after = before.clone();
        after.adjust(available, reserved)?;

        let movement = StockMovement::between(
            &before,
            &after,
            MovementKind::Adjustment,
            after.total - before.total,
            ctx,
        );
        Self::write_record(&mut tx, &before, &after).await?;
        Self::insert_movement(&mut tx, &movement).await?;
        tx.commit().await?;

        tracing::info!(%product_id, available, reserved, "inventory adjusted");
        self.broadcast(&after);
        Ok(after)
    }

    async fn get_inventory(&self, product_id: ProductId) -> Result<InventoryRecord> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM inventory WHERE product_id = $1"
        ))
        .bind(product_id.value())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_record(&row),
            None => Err(InventoryError::NotFound { product_id }),
        }
    }

    async fn movements(
        &self,
        product_id: ProductId,
        page: u32,
        size: u32,
    ) -> Result<Vec<StockMovement>> {
        let rows = sqlx::query(
            "SELECT * FROM stock_movements WHERE product_id = $1 \
             ORDER BY id DESC LIMIT $2 OFFSET $3",
        )
        .bind(product_id.value())
        .bind(i64::from(size))
        .bind(i64::from(page) * i64::from(size))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_movement).collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<InventoryUpdate> {
        self.updates.subscribe()
    }
}
