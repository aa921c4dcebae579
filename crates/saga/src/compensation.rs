//! Durable log of refunds owed by failed sagas.
//!
//! A refund is recorded here before the adapter is called and resolved
//! once the adapter confirms it, so a charge is never forgotten even if
//! the process dies between the two.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::Money;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Result, SagaError};
use crate::payment::Payment;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCompensation {
    pub id: Uuid,
    pub saga_id: String,
    pub order_number: String,
    pub payment_number: String,
    pub transaction_id: String,
    pub amount: Money,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl PendingCompensation {
    /// A refund owed for a completed payment.
    pub fn refund(saga_id: impl Into<String>, payment: &Payment) -> Result<Self> {
        let transaction_id =
            payment
                .transaction_id
                .clone()
                .ok_or_else(|| SagaError::InvalidPaymentStatus {
                    payment_number: payment.payment_number.clone(),
                    status: payment.status,
                    action: "refund",
                })?;
        Ok(Self {
            id: Uuid::new_v4(),
            saga_id: saga_id.into(),
            order_number: payment.order_number.clone(),
            payment_number: payment.payment_number.clone(),
            transaction_id,
            amount: payment.amount,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            resolved_at: None,
        })
    }
}

#[async_trait]
pub trait CompensationLog: Send + Sync {
    async fn record(&self, entry: &PendingCompensation) -> Result<()>;

    /// Counts one failed attempt.
    async fn record_failure(&self, id: Uuid, error: &str) -> Result<()>;

    async fn resolve(&self, id: Uuid) -> Result<()>;

    /// Unresolved entries, oldest first.
    async fn pending(&self) -> Result<Vec<PendingCompensation>>;
}

#[async_trait]
impl<T: CompensationLog + ?Sized> CompensationLog for Arc<T> {
    async fn record(&self, entry: &PendingCompensation) -> Result<()> {
        (**self).record(entry).await
    }

    async fn record_failure(&self, id: Uuid, error: &str) -> Result<()> {
        (**self).record_failure(id, error).await
    }

    async fn resolve(&self, id: Uuid) -> Result<()> {
        (**self).resolve(id).await
    }

    async fn pending(&self) -> Result<Vec<PendingCompensation>> {
        (**self).pending().await
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryCompensationLog {
    entries: Arc<RwLock<BTreeMap<Uuid, PendingCompensation>>>,
}

impl InMemoryCompensationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every entry, resolved or not.
    pub async fn all(&self) -> Vec<PendingCompensation> {
        self.entries.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl CompensationLog for InMemoryCompensationLog {
    async fn record(&self, entry: &PendingCompensation) -> Result<()> {
        self.entries.write().await.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn record_failure(&self, id: Uuid, error: &str) -> Result<()> {
        if let Some(entry) = self.entries.write().await.get_mut(&id) {
            entry.attempts += 1;
            entry.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn resolve(&self, id: Uuid) -> Result<()> {
        if let Some(entry) = self.entries.write().await.get_mut(&id) {
            entry.resolved_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<PendingCompensation>> {
        let mut pending: Vec<_> = self
            .entries
            .read()
            .await
            .values()
            .filter(|e| e.resolved_at.is_none())
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.created_at);
        Ok(pending)
    }
}

/// PostgreSQL-backed compensation log (`pending_compensations`).
#[derive(Clone)]
pub struct PostgresCompensationLog {
    pool: PgPool,
}

impl PostgresCompensationLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_entry(row: &PgRow) -> Result<PendingCompensation> {
        Ok(PendingCompensation {
            id: row.try_get("id")?,
            saga_id: row.try_get("saga_id")?,
            order_number: row.try_get("order_number")?,
            payment_number: row.try_get("payment_number")?,
            transaction_id: row.try_get("transaction_id")?,
            amount: Money::from_cents(row.try_get("amount_cents")?),
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            resolved_at: row.try_get("resolved_at")?,
        })
    }
}

#[async_trait]
impl CompensationLog for PostgresCompensationLog {
    async fn record(&self, entry: &PendingCompensation) -> Result<()> {
        sqlx::query(
            "INSERT INTO pending_compensations \
             (id, saga_id, order_number, payment_number, transaction_id, amount_cents, \
              attempts, last_error, created_at, resolved_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(entry.id)
        .bind(&entry.saga_id)
        .bind(&entry.order_number)
        .bind(&entry.payment_number)
        .bind(&entry.transaction_id)
        .bind(entry.amount.cents())
        .bind(entry.attempts)
        .bind(&entry.last_error)
        .bind(entry.created_at)
        .bind(entry.resolved_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_failure(&self, id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE pending_compensations SET attempts = attempts + 1, last_error = $2 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn resolve(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE pending_compensations SET resolved_at = NOW() \
             WHERE id = $1 AND resolved_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<PendingCompensation>> {
        let rows = sqlx::query(
            "SELECT id, saga_id, order_number, payment_number, transaction_id, amount_cents, \
                    attempts, last_error, created_at, resolved_at \
             FROM pending_compensations WHERE resolved_at IS NULL ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_entry).collect()
    }
}

#[cfg(test)]
mod tests {
    use common::ActorId;

    use super::*;
    use crate::payment::PaymentMethod;

    fn completed_payment() -> Payment {
        let mut payment = Payment::new(
            "ORD-1",
            ActorId::new("buyer"),
            Money::from_cents(2500),
            PaymentMethod::Card,
        );
        payment.start_processing().unwrap();
        payment.complete("PG-TX").unwrap();
        payment
    }

    #[test]
    fn refund_entry_needs_a_transaction() {
        let pending = Payment::new(
            "ORD-1",
            ActorId::new("buyer"),
            Money::from_cents(1),
            PaymentMethod::Card,
        );
        assert!(PendingCompensation::refund("SAGA-1", &pending).is_err());

        let entry = PendingCompensation::refund("SAGA-1", &completed_payment()).unwrap();
        assert_eq!(entry.transaction_id, "PG-TX");
        assert_eq!(entry.amount, Money::from_cents(2500));
    }

    #[tokio::test]
    async fn test_in_memory_log_lifecycle() {
        let log = InMemoryCompensationLog::new();
        let entry = PendingCompensation::refund("SAGA-1", &completed_payment()).unwrap();
        log.record(&entry).await.unwrap();

        log.record_failure(entry.id, "NETWORK_ERROR").await.unwrap();
        let pending = log.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 1);
        assert_eq!(pending[0].last_error.as_deref(), Some("NETWORK_ERROR"));

        log.resolve(entry.id).await.unwrap();
        assert!(log.pending().await.unwrap().is_empty());
        assert_eq!(log.all().await.len(), 1);
    }
}
