//! In-memory order, payment and saga repositories.
//!
//! Updates run a closure under the write lock, so every status
//! transition re-validates against the stored state. Multi-step
//! operations on one order additionally hold that order's lock.

use std::collections::HashMap;
use std::sync::Arc;

use common::ActorId;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::error::{Result, SagaError};
use crate::order::Order;
use crate::payment::Payment;
use crate::state::{SagaState, SagaStatus};

#[derive(Debug, Clone, Default)]
pub struct OrderRepository {
    orders: Arc<RwLock<HashMap<String, Order>>>,
    locks: Arc<RwLock<HashMap<String, Arc<Mutex<()>>>>>,
}

impl OrderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, order: Order) {
        self.locks
            .write()
            .await
            .insert(order.order_number.clone(), Arc::default());
        self.orders
            .write()
            .await
            .insert(order.order_number.clone(), order);
    }

    /// Takes the order's exclusive lock, held until the guard drops.
    pub async fn lock(&self, order_number: &str) -> Result<OwnedMutexGuard<()>> {
        let lock = self
            .locks
            .read()
            .await
            .get(order_number)
            .cloned()
            .ok_or_else(|| SagaError::OrderNotFound(order_number.to_string()))?;
        Ok(lock.lock_owned().await)
    }

    pub async fn get(&self, order_number: &str) -> Result<Order> {
        self.orders
            .read()
            .await
            .get(order_number)
            .cloned()
            .ok_or_else(|| SagaError::OrderNotFound(order_number.to_string()))
    }

    /// Applies `f` to the stored order. Nothing is written if `f` fails.
    pub async fn update<F>(&self, order_number: &str, f: F) -> Result<Order>
    where
        F: FnOnce(&mut Order) -> Result<()>,
    {
        let mut orders = self.orders.write().await;
        let stored = orders
            .get_mut(order_number)
            .ok_or_else(|| SagaError::OrderNotFound(order_number.to_string()))?;
        let mut updated = stored.clone();
        f(&mut updated)?;
        *stored = updated.clone();
        Ok(updated)
    }

    /// Orders placed by `actor`, newest first.
    pub async fn for_actor(&self, actor: &ActorId) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .orders
            .read()
            .await
            .values()
            .filter(|o| &o.actor == actor)
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        orders
    }
}

#[derive(Debug, Clone, Default)]
pub struct PaymentRepository {
    payments: Arc<RwLock<HashMap<String, Payment>>>,
}

impl PaymentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a new payment unless the order already has one that is not
    /// failed or cancelled.
    pub async fn insert(&self, payment: Payment) -> Result<()> {
        let mut payments = self.payments.write().await;
        if payments
            .values()
            .any(|p| p.order_number == payment.order_number && p.status.blocks_new_payment())
        {
            return Err(SagaError::DuplicatePayment(payment.order_number));
        }
        payments.insert(payment.payment_number.clone(), payment);
        Ok(())
    }

    pub async fn get(&self, payment_number: &str) -> Result<Payment> {
        self.payments
            .read()
            .await
            .get(payment_number)
            .cloned()
            .ok_or_else(|| SagaError::PaymentNotFound(payment_number.to_string()))
    }

    /// The payment that currently holds the order, if any.
    pub async fn active_for_order(&self, order_number: &str) -> Option<Payment> {
        self.payments
            .read()
            .await
            .values()
            .find(|p| p.order_number == order_number && p.status.blocks_new_payment())
            .cloned()
    }

    /// Every payment attempt for the order, oldest first.
    pub async fn for_order(&self, order_number: &str) -> Vec<Payment> {
        let mut payments: Vec<Payment> = self
            .payments
            .read()
            .await
            .values()
            .filter(|p| p.order_number == order_number)
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.created_at);
        payments
    }

    pub async fn update<F>(&self, payment_number: &str, f: F) -> Result<Payment>
    where
        F: FnOnce(&mut Payment) -> Result<()>,
    {
        let mut payments = self.payments.write().await;
        let stored = payments
            .get_mut(payment_number)
            .ok_or_else(|| SagaError::PaymentNotFound(payment_number.to_string()))?;
        let mut updated = stored.clone();
        f(&mut updated)?;
        *stored = updated.clone();
        Ok(updated)
    }
}

/// One saga record per order.
#[derive(Debug, Clone, Default)]
pub struct SagaRepository {
    sagas: Arc<RwLock<HashMap<String, SagaState>>>,
}

impl SagaRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn save(&self, saga: &SagaState) {
        self.sagas
            .write()
            .await
            .insert(saga.order_number.clone(), saga.clone());
    }

    pub async fn for_order(&self, order_number: &str) -> Option<SagaState> {
        self.sagas.read().await.get(order_number).cloned()
    }

    pub async fn with_status(&self, status: SagaStatus) -> Vec<SagaState> {
        self.sagas
            .read()
            .await
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect()
    }

    pub async fn by_id(&self, saga_id: &str) -> Option<SagaState> {
        self.sagas
            .read()
            .await
            .values()
            .find(|s| s.saga_id == saga_id)
            .cloned()
    }
}
