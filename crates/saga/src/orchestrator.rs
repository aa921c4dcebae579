//! The order-payment saga orchestrator.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use common::events::{
    DeliveryShippedData, OrderCancelledData, OrderCreatedData, PaymentCompletedData,
    PaymentFailedData, PaymentRefundedData,
};
use common::{ActorId, DomainEvent, EventPublisher, Money};
use inventory::{InventoryLedger, MovementContext, StockOperation};

use crate::adapter::{AdapterResponse, PaymentAdapter};
use crate::compensation::{CompensationLog, InMemoryCompensationLog, PendingCompensation};
use crate::error::{Result, SagaError};
use crate::order::{Order, OrderItem, OrderStatus, ShippingInfo};
use crate::payment::{Payment, PaymentMethod, PaymentStatus};
use crate::repository::{OrderRepository, PaymentRepository, SagaRepository};
use crate::state::{SagaState, SagaStatus};
use crate::steps::{Compensation, SagaStep, plan_compensations};

/// Saga tunables.
#[derive(Debug, Clone)]
pub struct SagaConfig {
    /// Bound on every adapter call. A timeout counts as a failure.
    pub payment_timeout: Duration,
    /// Inline attempts at a compensating refund before it is left to
    /// [`OrderSagaOrchestrator::retry_pending_compensations`].
    pub max_compensation_attempts: u32,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            payment_timeout: Duration::from_secs(5),
            max_compensation_attempts: 3,
        }
    }
}

/// Drives orders through reservation, payment and settlement.
///
/// Forward steps and their compensations are recorded on a [`SagaState`]
/// per order; on failure the orchestrator runs the compensation table
/// over the steps still in effect, most recent first. A refund owed
/// after a successful charge goes through the durable
/// [`CompensationLog`] so it survives a restart.
pub struct OrderSagaOrchestrator<L, A>
where
    L: InventoryLedger,
    A: PaymentAdapter,
{
    ledger: L,
    adapter: A,
    orders: OrderRepository,
    payments: PaymentRepository,
    sagas: SagaRepository,
    compensations: Arc<dyn CompensationLog>,
    events: Arc<dyn EventPublisher>,
    config: SagaConfig,
}

impl<L, A> OrderSagaOrchestrator<L, A>
where
    L: InventoryLedger,
    A: PaymentAdapter,
{
    /// Creates an orchestrator with in-memory repositories and an
    /// in-memory compensation log.
    pub fn new(ledger: L, adapter: A, events: Arc<dyn EventPublisher>, config: SagaConfig) -> Self {
        Self {
            ledger,
            adapter,
            orders: OrderRepository::new(),
            payments: PaymentRepository::new(),
            sagas: SagaRepository::new(),
            compensations: Arc::new(InMemoryCompensationLog::new()),
            events,
            config,
        }
    }

    /// Replaces the compensation log, e.g. with a Postgres-backed one.
    pub fn with_compensation_log(mut self, log: Arc<dyn CompensationLog>) -> Self {
        self.compensations = log;
        self
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub async fn get_order(&self, order_number: &str) -> Result<Order> {
        self.orders.get(order_number).await
    }

    /// Loads an order on behalf of its owner.
    pub async fn get_order_for(&self, actor: &ActorId, order_number: &str) -> Result<Order> {
        let order = self.orders.get(order_number).await?;
        if !order.is_owned_by(actor) {
            return Err(SagaError::OrderOwnerMismatch(order_number.to_string()));
        }
        Ok(order)
    }

    pub async fn orders_for(&self, actor: &ActorId) -> Vec<Order> {
        self.orders.for_actor(actor).await
    }

    pub async fn get_payment(&self, payment_number: &str) -> Result<Payment> {
        self.payments.get(payment_number).await
    }

    pub async fn payments_for_order(&self, order_number: &str) -> Vec<Payment> {
        self.payments.for_order(order_number).await
    }

    pub async fn get_saga(&self, order_number: &str) -> Option<SagaState> {
        self.sagas.for_order(order_number).await
    }

    /// Creates an order and reserves its stock.
    ///
    /// If the reservation fails the order stays PENDING and the ledger
    /// error is returned; no stock has moved.
    #[tracing::instrument(skip(self, shipping, items))]
    pub async fn create_order(
        &self,
        actor: &ActorId,
        shipping: ShippingInfo,
        items: Vec<OrderItem>,
    ) -> Result<Order> {
        metrics::counter!("saga_executions_total", "operation" => "create_order").increment(1);
        let started = Instant::now();

        let order = Order::new(actor.clone(), shipping, items)?;
        let order_number = order.order_number.clone();
        self.orders.insert(order.clone()).await;

        let mut saga = SagaState::new(&order_number);
        self.sagas.save(&saga).await;

        if let Err(e) = self.reserve(&mut saga, &order).await {
            saga.fail(e.to_string());
            self.sagas.save(&saga).await;
            record_outcome("failed", started);
            tracing::warn!(saga_id = %saga.saga_id, %order_number, error = %e, "order reservation failed");
            return Err(e);
        }

        saga.begin(SagaStep::ConfirmOrder);
        let order = match self.orders.update(&order_number, Order::confirm).await {
            Ok(order) => order,
            Err(e) => {
                saga.start_compensation(e.to_string());
                if let Err(comp) = self.compensate(&mut saga, &order, None).await {
                    return Err(self.compensation_failed(&mut saga, None, comp).await);
                }
                saga.fail(e.to_string());
                self.sagas.save(&saga).await;
                record_outcome("failed", started);
                return Err(e);
            }
        };
        saga.complete_step(SagaStep::ConfirmOrder);
        self.sagas.save(&saga).await;

        self.events
            .publish(DomainEvent::OrderCreated(OrderCreatedData {
                order_number: order.order_number.clone(),
                actor_id: order.actor.clone(),
                total_amount: order.total_amount,
                items: order.lines(),
                created_at: order.created_at,
            }))
            .await;

        metrics::histogram!("saga_duration_seconds").record(started.elapsed().as_secs_f64());
        tracing::info!(saga_id = %saga.saga_id, %order_number, total = %order.total_amount, "order created");
        Ok(order)
    }

    /// Charges a confirmed order and settles it.
    ///
    /// A declined or timed-out charge marks the payment FAILED and
    /// releases the reservation; the order stays CONFIRMED and may be
    /// paid again. A failure after the charge succeeded refunds it and
    /// cancels the order.
    pub async fn process_payment(
        &self,
        actor: &ActorId,
        order_number: &str,
        method: PaymentMethod,
    ) -> Result<Payment> {
        self.process_discounted_payment(actor, order_number, method, None)
            .await
    }

    /// Like [`process_payment`](Self::process_payment), applying `discount`
    /// under the order lock first. Any failed attempt clears the order's
    /// discount again, so it is charged in full unless the next attempt
    /// brings its own.
    #[tracing::instrument(skip(self))]
    pub async fn process_discounted_payment(
        &self,
        actor: &ActorId,
        order_number: &str,
        method: PaymentMethod,
        discount: Option<Money>,
    ) -> Result<Payment> {
        metrics::counter!("saga_executions_total", "operation" => "process_payment").increment(1);
        let started = Instant::now();

        let _guard = self.orders.lock(order_number).await?;
        let order = self.orders.get(order_number).await?;
        if !order.is_owned_by(actor) {
            return Err(SagaError::OrderOwnerMismatch(order_number.to_string()));
        }
        match order.status {
            OrderStatus::Confirmed => {}
            OrderStatus::Paid => return Err(SagaError::OrderAlreadyPaid(order_number.to_string())),
            status => {
                return Err(SagaError::InvalidOrderStatus {
                    order_number: order_number.to_string(),
                    status,
                    action: "pay",
                });
            }
        }
        self.ensure_reconciled(order_number).await?;

        let order = match discount {
            Some(discount) => {
                self.orders
                    .update(order_number, |o| o.apply_discount(discount))
                    .await?
            }
            None => order,
        };

        let result = self.charge_and_settle(&order, method, started).await;
        if result.is_err() {
            if let Err(e) = self.orders.update(order_number, Order::clear_discount).await {
                tracing::warn!(%order_number, error = %e, "could not clear discount after failed payment");
            }
        }
        result
    }

    async fn charge_and_settle(
        &self,
        order: &Order,
        method: PaymentMethod,
        started: Instant,
    ) -> Result<Payment> {
        let order_number = order.order_number.as_str();
        let actor = &order.actor;

        // rejected here, before any external call
        let payment = Payment::new(order_number, actor.clone(), order.final_amount, method);
        let payment_number = payment.payment_number.clone();
        self.payments.insert(payment).await?;

        let mut saga = self
            .sagas
            .for_order(order_number)
            .await
            .unwrap_or_else(|| SagaState::new(order_number));
        saga.resume();

        if !order.stock_reserved {
            if let Err(e) = self.reserve(&mut saga, order).await {
                self.payments
                    .update(&payment_number, |p| {
                        p.cancel(format!("stock could not be reserved: {e}"))
                    })
                    .await?;
                saga.fail(e.to_string());
                self.sagas.save(&saga).await;
                record_outcome("failed", started);
                return Err(e);
            }
        }

        let payment = self
            .payments
            .update(&payment_number, Payment::start_processing)
            .await?;
        saga.begin(SagaStep::ProcessPayment);
        self.sagas.save(&saga).await;

        let response = self.call_charge(&payment).await;
        let Some(transaction_id) = response.transaction_id.clone().filter(|_| response.success)
        else {
            return self
                .fail_payment(saga, order, payment, response, started)
                .await;
        };

        let payment = self
            .payments
            .update(&payment_number, |p| p.complete(transaction_id))
            .await?;
        saga.complete_step(SagaStep::ProcessPayment);
        self.sagas.save(&saga).await;

        saga.begin(SagaStep::DeductInventory);
        let ctx = MovementContext::order(order_number, actor.clone());
        let deducted = match self.ledger.deduct(&order.stock_batch(), &ctx).await {
            Ok(_) => {
                self.orders
                    .update(order_number, |o| {
                        o.stock_reserved = false;
                        Ok(())
                    })
                    .await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = deducted {
            return self.undo_charge(saga, payment, e.to_string(), started).await;
        }
        saga.complete_step(SagaStep::DeductInventory);
        // the deduction consumed the reservation
        saga.retire(SagaStep::ReserveInventory);
        self.sagas.save(&saga).await;

        saga.begin(SagaStep::CompleteOrder);
        if let Err(e) = self.orders.update(order_number, Order::mark_paid).await {
            return self.undo_charge(saga, payment, e.to_string(), started).await;
        }
        saga.complete_step(SagaStep::CompleteOrder);
        saga.complete();
        self.sagas.save(&saga).await;

        self.events
            .publish(DomainEvent::PaymentCompleted(PaymentCompletedData {
                payment_number: payment.payment_number.clone(),
                order_number: order_number.to_string(),
                actor_id: actor.clone(),
                amount: payment.amount,
                method: payment.method.as_str().to_string(),
                transaction_id: payment.transaction_id.clone().unwrap_or_default(),
                completed_at: payment.paid_at.unwrap_or_else(Utc::now),
            }))
            .await;

        let duration = started.elapsed().as_secs_f64();
        record_outcome("completed", started);
        tracing::info!(saga_id = %saga.saga_id, %order_number, %payment_number, duration, "saga completed successfully");
        Ok(payment)
    }

    /// Cancels an order, undoing whatever stock and payment it holds.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_order(
        &self,
        actor: &ActorId,
        order_number: &str,
        reason: &str,
    ) -> Result<Order> {
        let _guard = self.orders.lock(order_number).await?;
        let order = self.get_order_for(actor, order_number).await?;
        if !order.status.is_cancellable() {
            return Err(SagaError::InvalidOrderStatus {
                order_number: order_number.to_string(),
                status: order.status,
                action: "cancel",
            });
        }
        self.ensure_reconciled(order_number).await?;

        let ctx = MovementContext::order_cancel(order_number, reason);
        if order.status == OrderStatus::Paid {
            self.refund_settled_payment(order_number).await?;
            self.ledger.return_stock(&order.stock_batch(), &ctx).await?;
        } else if order.stock_reserved {
            self.ledger.release(&order.stock_batch(), &ctx).await?;
        }

        let order = self
            .orders
            .update(order_number, |o| {
                o.cancel(reason)?;
                o.stock_reserved = false;
                Ok(())
            })
            .await?;
        if let Some(mut saga) = self.sagas.for_order(order_number).await {
            if saga.status == SagaStatus::CompensationFailed {
                // the cancellation just undid what the saga could not
                saga.retire(SagaStep::ReserveInventory);
                saga.fail(format!("order cancelled: {reason}"));
                self.sagas.save(&saga).await;
            }
        }
        self.publish_cancelled(&order).await;
        tracing::info!(%order_number, reason, "order cancelled");
        Ok(order)
    }

    /// Refunds a paid or shipping order and returns its stock.
    #[tracing::instrument(skip(self))]
    pub async fn refund_order(&self, order_number: &str) -> Result<Order> {
        let _guard = self.orders.lock(order_number).await?;
        let order = self.orders.get(order_number).await?;
        if !order.status.is_refundable() {
            return Err(SagaError::InvalidOrderStatus {
                order_number: order_number.to_string(),
                status: order.status,
                action: "refund",
            });
        }

        self.refund_settled_payment(order_number).await?;
        let ctx = MovementContext::order_cancel(order_number, "order refunded");
        self.ledger.return_stock(&order.stock_batch(), &ctx).await?;

        let order = self.orders.update(order_number, Order::refund).await?;
        tracing::info!(%order_number, "order refunded");
        Ok(order)
    }

    #[tracing::instrument(skip(self))]
    pub async fn ship(&self, order_number: &str) -> Result<Order> {
        let _guard = self.orders.lock(order_number).await?;
        let order = self.orders.update(order_number, Order::ship).await?;
        self.events
            .publish(DomainEvent::DeliveryShipped(DeliveryShippedData {
                order_number: order.order_number.clone(),
                actor_id: order.actor.clone(),
                shipped_at: order.updated_at,
            }))
            .await;
        Ok(order)
    }

    #[tracing::instrument(skip(self))]
    pub async fn deliver(&self, order_number: &str) -> Result<Order> {
        let _guard = self.orders.lock(order_number).await?;
        self.orders.update(order_number, Order::deliver).await
    }

    /// Reduces the amount the order will be charged.
    #[tracing::instrument(skip(self))]
    pub async fn apply_discount(
        &self,
        actor: &ActorId,
        order_number: &str,
        discount: Money,
    ) -> Result<Order> {
        let _guard = self.orders.lock(order_number).await?;
        self.get_order_for(actor, order_number).await?;
        self.orders
            .update(order_number, |o| o.apply_discount(discount))
            .await
    }

    /// Retries every unresolved compensation once.
    ///
    /// Pending refunds are retried first; sagas whose refund goes through
    /// finish their remaining compensations and cancel the order. Sagas
    /// stuck on a stock step with no refund outstanding then rerun their
    /// compensations. Returns the number resolved.
    #[tracing::instrument(skip(self))]
    pub async fn retry_pending_compensations(&self) -> Result<usize> {
        let mut resolved = 0;
        for entry in self.compensations.pending().await? {
            let _guard = self.orders.lock(&entry.order_number).await.ok();

            let payment = self.payments.get(&entry.payment_number).await.ok();
            let already_refunded = payment
                .as_ref()
                .is_some_and(|p| p.status == PaymentStatus::Refunded);

            if !already_refunded {
                let response = self.call_refund(&entry.transaction_id, entry.amount).await;
                if !response.success {
                    let error = format!("{}: {}", response.error_code(), response.message());
                    self.compensations.record_failure(entry.id, &error).await?;
                    tracing::warn!(
                        payment_number = %entry.payment_number,
                        attempts = entry.attempts + 1,
                        %error,
                        "pending refund still failing"
                    );
                    continue;
                }
                if payment.is_some() {
                    let refund_id = response.transaction_id.unwrap_or_default();
                    self.mark_refunded(&entry.payment_number, refund_id).await?;
                }
            }

            self.compensations.resolve(entry.id).await?;
            resolved += 1;
            tracing::info!(payment_number = %entry.payment_number, "pending refund resolved");
            if let Err(e) = self.finish_compensation(&entry).await {
                tracing::error!(
                    order_number = %entry.order_number,
                    error = %e,
                    "compensation after resolved refund failed"
                );
            }
        }

        let awaiting_refund: HashSet<String> = self
            .compensations
            .pending()
            .await?
            .into_iter()
            .map(|entry| entry.order_number)
            .collect();
        for saga in self.sagas.with_status(SagaStatus::CompensationFailed).await {
            if awaiting_refund.contains(&saga.order_number) {
                continue;
            }
            match self.finish_stock_compensation(&saga.order_number).await {
                Ok(true) => resolved += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(
                    order_number = %saga.order_number,
                    error = %e,
                    "stock compensation still failing"
                ),
            }
        }
        Ok(resolved)
    }

    async fn reserve(&self, saga: &mut SagaState, order: &Order) -> Result<()> {
        saga.begin(SagaStep::ReserveInventory);
        let ctx = MovementContext::order(&order.order_number, order.actor.clone());
        self.ledger.reserve(&order.stock_batch(), &ctx).await?;
        self.orders
            .update(&order.order_number, |o| {
                o.stock_reserved = true;
                Ok(())
            })
            .await?;
        saga.complete_step(SagaStep::ReserveInventory);
        self.sagas.save(saga).await;
        Ok(())
    }

    /// Handles a declined or timed-out charge. Always returns an error.
    async fn fail_payment(
        &self,
        mut saga: SagaState,
        order: &Order,
        payment: Payment,
        response: AdapterResponse,
        started: Instant,
    ) -> Result<Payment> {
        let error_code = response.error_code().to_string();
        let message = response.message().to_string();
        let reason = format!("{error_code}: {message}");

        let payment = self
            .payments
            .update(&payment.payment_number, |p| p.fail(reason.clone()))
            .await?;
        self.events
            .publish(DomainEvent::PaymentFailed(PaymentFailedData {
                payment_number: payment.payment_number.clone(),
                order_number: order.order_number.clone(),
                actor_id: payment.actor.clone(),
                amount: payment.amount,
                error_code: error_code.clone(),
                message: message.clone(),
                failed_at: payment.updated_at,
            }))
            .await;

        saga.start_compensation(reason.clone());
        self.sagas.save(&saga).await;
        let order = self.orders.get(&order.order_number).await?;
        if let Err(e) = self.compensate(&mut saga, &order, None).await {
            return Err(self.compensation_failed(&mut saga, Some(&payment), e).await);
        }
        saga.fail(reason);
        self.sagas.save(&saga).await;

        record_outcome("failed", started);
        tracing::warn!(
            saga_id = %saga.saga_id,
            order_number = %order.order_number,
            payment_number = %payment.payment_number,
            %error_code,
            "saga failed"
        );
        Err(SagaError::PaymentFailed {
            payment_number: payment.payment_number,
            error_code,
            message,
        })
    }

    /// Handles a failure after the charge succeeded: refunds, undoes the
    /// stock steps and cancels the order. Always returns an error.
    async fn undo_charge(
        &self,
        mut saga: SagaState,
        payment: Payment,
        reason: String,
        started: Instant,
    ) -> Result<Payment> {
        tracing::warn!(
            saga_id = %saga.saga_id,
            order_number = %payment.order_number,
            payment_number = %payment.payment_number,
            error = %reason,
            "order completion failed after charge"
        );
        saga.start_compensation(reason.clone());
        self.sagas.save(&saga).await;

        let order = self.orders.get(&payment.order_number).await?;
        if let Err(e) = self.compensate(&mut saga, &order, Some(&payment)).await {
            return Err(self.compensation_failed(&mut saga, Some(&payment), e).await);
        }
        self.cancel_after_compensation(&order.order_number, &reason)
            .await?;
        saga.fail(reason.clone());
        self.sagas.save(&saga).await;

        record_outcome("failed", started);
        tracing::warn!(saga_id = %saga.saga_id, order_number = %order.order_number, "saga failed");
        Err(SagaError::OrderCompletionFailed {
            order_number: order.order_number,
            reason,
        })
    }

    /// Runs the compensation table over the steps still in effect, most
    /// recent first. Stops at the first compensation that fails.
    async fn compensate(
        &self,
        saga: &mut SagaState,
        order: &Order,
        payment: Option<&Payment>,
    ) -> Result<()> {
        for (step, compensation) in plan_compensations(&saga.completed_steps) {
            tracing::info!(
                saga_id = %saga.saga_id,
                step = step.as_str(),
                compensation = compensation.as_str(),
                "compensating"
            );
            metrics::counter!("saga_compensations_total", "compensation" => compensation.as_str())
                .increment(1);

            let ctx = MovementContext::order_cancel(
                &order.order_number,
                format!("saga compensation: {}", compensation.as_str()),
            );
            match compensation {
                Compensation::ReleaseInventory => {
                    let current = self.orders.get(&order.order_number).await?;
                    if current.stock_reserved {
                        self.undo_stock(StockOperation::Release, order, &ctx).await?;
                        self.orders
                            .update(&order.order_number, |o| {
                                o.stock_reserved = false;
                                Ok(())
                            })
                            .await?;
                    }
                }
                Compensation::ReturnStock => {
                    self.undo_stock(StockOperation::Return, order, &ctx).await?;
                }
                Compensation::RefundPayment => {
                    let payment = payment
                        .ok_or_else(|| SagaError::PaymentNotFound(order.order_number.clone()))?;
                    self.refund_durably(saga, payment).await?;
                }
            }
            saga.retire(step);
            self.sagas.save(saga).await;
        }
        Ok(())
    }

    /// Applies a compensating stock operation, retrying transient ledger
    /// failures up to `max_compensation_attempts` times.
    async fn undo_stock(
        &self,
        op: StockOperation,
        order: &Order,
        ctx: &MovementContext,
    ) -> Result<()> {
        let batch = order.stock_batch();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.ledger.apply(op, &batch, ctx).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.config.max_compensation_attempts => {
                    tracing::warn!(
                        attempt,
                        order_number = %order.order_number,
                        op = op.as_str(),
                        error = %e,
                        "compensating stock operation failed, retrying"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Records the refund in the compensation log, then tries it up to
    /// `max_compensation_attempts` times. The entry stays pending if every
    /// attempt fails.
    async fn refund_durably(&self, saga: &mut SagaState, payment: &Payment) -> Result<Payment> {
        let entry = PendingCompensation::refund(&saga.saga_id, payment)?;
        self.compensations.record(&entry).await?;

        let mut last = AdapterResponse::failure("NOT_ATTEMPTED", "no refund attempts configured");
        for attempt in 1..=self.config.max_compensation_attempts {
            saga.compensation_attempts += 1;
            let response = self.call_refund(&entry.transaction_id, entry.amount).await;
            if response.success {
                let refund_id = response.transaction_id.unwrap_or_default();
                let refunded = self.mark_refunded(&entry.payment_number, refund_id).await?;
                self.compensations.resolve(entry.id).await?;
                return Ok(refunded);
            }

            let error = format!("{}: {}", response.error_code(), response.message());
            tracing::warn!(
                attempt,
                payment_number = %entry.payment_number,
                %error,
                "compensating refund failed"
            );
            self.compensations.record_failure(entry.id, &error).await?;
            last = response;
        }

        Err(SagaError::RefundFailed {
            payment_number: entry.payment_number,
            error_code: last.error_code().to_string(),
            message: last.message().to_string(),
        })
    }

    /// Marks a saga whose compensation could not finish. The order is left
    /// as it is until the pending refund is resolved.
    async fn compensation_failed(
        &self,
        saga: &mut SagaState,
        payment: Option<&Payment>,
        error: SagaError,
    ) -> SagaError {
        saga.compensation_failed(error.to_string());
        self.sagas.save(saga).await;
        metrics::counter!("saga_compensation_failures_total").increment(1);
        tracing::error!(
            saga_id = %saga.saga_id,
            order_number = %saga.order_number,
            payment_number = payment.map(|p| p.payment_number.as_str()),
            transaction_id = payment.and_then(|p| p.transaction_id.as_deref()),
            error = %error,
            "compensation failed, manual reconciliation required"
        );
        SagaError::CompensationFailed {
            saga_id: saga.saga_id.clone(),
            order_number: saga.order_number.clone(),
            reason: error.to_string(),
        }
    }

    /// Completes a saga whose stranded refund was just resolved.
    async fn finish_compensation(&self, entry: &PendingCompensation) -> Result<()> {
        let Some(mut saga) = self.sagas.by_id(&entry.saga_id).await else {
            return Ok(());
        };
        let Ok(order) = self.orders.get(&entry.order_number).await else {
            return Ok(());
        };

        saga.retire(SagaStep::ProcessPayment);
        if let Err(e) = self.compensate(&mut saga, &order, None).await {
            return Err(self.compensation_failed(&mut saga, None, e).await);
        }
        let reason = saga
            .last_error
            .clone()
            .unwrap_or_else(|| "payment could not be completed".to_string());
        self.cancel_after_compensation(&order.order_number, &reason)
            .await?;
        saga.fail(reason);
        self.sagas.save(&saga).await;
        Ok(())
    }

    /// Reruns the compensations of a saga that failed on a stock step.
    ///
    /// Returns false if the saga was settled meanwhile. An order that was
    /// charged is cancelled once its compensations finish; one whose charge
    /// was declined stays CONFIRMED.
    async fn finish_stock_compensation(&self, order_number: &str) -> Result<bool> {
        let _guard = self.orders.lock(order_number).await?;
        let Some(mut saga) = self
            .sagas
            .for_order(order_number)
            .await
            .filter(|s| s.status == SagaStatus::CompensationFailed)
        else {
            return Ok(false);
        };
        let order = self.orders.get(order_number).await?;
        let charged = self.payments.active_for_order(order_number).await;
        let unrefunded = charged
            .as_ref()
            .filter(|p| p.status == PaymentStatus::Completed);

        if let Err(e) = self.compensate(&mut saga, &order, unrefunded).await {
            return Err(self.compensation_failed(&mut saga, unrefunded, e).await);
        }
        let reason = saga
            .last_error
            .clone()
            .unwrap_or_else(|| "payment could not be completed".to_string());
        if charged.is_some() {
            self.cancel_after_compensation(order_number, &reason)
                .await?;
        }
        saga.fail(reason);
        self.sagas.save(&saga).await;
        tracing::info!(saga_id = %saga.saga_id, %order_number, "stranded stock compensation resolved");
        Ok(true)
    }

    async fn cancel_after_compensation(&self, order_number: &str, reason: &str) -> Result<()> {
        let order = self
            .orders
            .update(order_number, |o| {
                if o.status.is_cancellable() {
                    o.cancel(format!("payment could not be completed: {reason}"))?;
                }
                Ok(())
            })
            .await?;
        if order.status == OrderStatus::Cancelled {
            self.publish_cancelled(&order).await;
        }
        Ok(())
    }

    /// Rejects actions on an order whose failed compensation still holds a
    /// charge: a refund awaiting retry, or stock not yet restored after one.
    ///
    /// A failure that left only a reservation behind does not block; the
    /// order's `stock_reserved` flag still tells pay and cancel what to do.
    async fn ensure_reconciled(&self, order_number: &str) -> Result<()> {
        let Some(saga) = self.sagas.for_order(order_number).await else {
            return Ok(());
        };
        if saga.status != SagaStatus::CompensationFailed {
            return Ok(());
        }
        if self.payments.active_for_order(order_number).await.is_some() {
            return Err(SagaError::CompensationFailed {
                saga_id: saga.saga_id,
                order_number: order_number.to_string(),
                reason: "refund awaiting reconciliation".to_string(),
            });
        }
        Ok(())
    }

    /// Refunds the order's completed payment, unless already refunded.
    async fn refund_settled_payment(&self, order_number: &str) -> Result<()> {
        let payment = self
            .payments
            .active_for_order(order_number)
            .await
            .ok_or_else(|| SagaError::PaymentNotFound(order_number.to_string()))?;
        match payment.status {
            PaymentStatus::Refunded => return Ok(()),
            PaymentStatus::Completed => {}
            status => {
                return Err(SagaError::InvalidPaymentStatus {
                    payment_number: payment.payment_number,
                    status,
                    action: "refund",
                });
            }
        }

        let transaction_id = payment.transaction_id.clone().unwrap_or_default();
        let response = self.call_refund(&transaction_id, payment.amount).await;
        if !response.success {
            return Err(SagaError::RefundFailed {
                payment_number: payment.payment_number,
                error_code: response.error_code().to_string(),
                message: response.message().to_string(),
            });
        }
        let refund_id = response.transaction_id.unwrap_or_default();
        self.mark_refunded(&payment.payment_number, refund_id)
            .await?;
        Ok(())
    }

    async fn mark_refunded(&self, payment_number: &str, refund_id: String) -> Result<Payment> {
        let payment = self
            .payments
            .update(payment_number, |p| p.refund(refund_id))
            .await?;
        self.events
            .publish(DomainEvent::PaymentRefunded(PaymentRefundedData {
                payment_number: payment.payment_number.clone(),
                order_number: payment.order_number.clone(),
                amount: payment.amount,
                refund_id: payment.refund_id.clone().unwrap_or_default(),
                refunded_at: payment.refunded_at.unwrap_or_else(Utc::now),
            }))
            .await;
        tracing::info!(%payment_number, amount = %payment.amount, "payment refunded");
        Ok(payment)
    }

    async fn publish_cancelled(&self, order: &Order) {
        self.events
            .publish(DomainEvent::OrderCancelled(OrderCancelledData {
                order_number: order.order_number.clone(),
                actor_id: order.actor.clone(),
                reason: order.cancel_reason.clone().unwrap_or_default(),
                cancelled_at: order.cancelled_at.unwrap_or_else(Utc::now),
            }))
            .await;
    }

    async fn call_charge(&self, payment: &Payment) -> AdapterResponse {
        let call = self
            .adapter
            .charge(&payment.payment_number, payment.amount, payment.method);
        match tokio::time::timeout(self.config.payment_timeout, call).await {
            Ok(response) => response,
            Err(_) => timed_out(self.config.payment_timeout),
        }
    }

    async fn call_refund(&self, transaction_id: &str, amount: Money) -> AdapterResponse {
        let call = self.adapter.refund(transaction_id, amount);
        match tokio::time::timeout(self.config.payment_timeout, call).await {
            Ok(response) => response,
            Err(_) => timed_out(self.config.payment_timeout),
        }
    }
}

fn timed_out(after: Duration) -> AdapterResponse {
    AdapterResponse::failure(
        "TIMEOUT",
        format!("no response from the payment gateway within {}ms", after.as_millis()),
    )
}

fn record_outcome(outcome: &'static str, started: Instant) {
    metrics::histogram!("saga_duration_seconds").record(started.elapsed().as_secs_f64());
    match outcome {
        "completed" => metrics::counter!("saga_completed").increment(1),
        _ => metrics::counter!("saga_failed").increment(1),
    }
}
