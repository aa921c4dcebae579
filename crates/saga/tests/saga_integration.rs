//! Integration tests for the order-payment saga.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use common::{ActorId, InMemoryEventPublisher, Money, ProductId};
use inventory::{
    InMemoryInventoryLedger, InventoryError, InventoryLedger, InventoryRecord, InventoryUpdate,
    MovementContext, StockBatch, StockMovement, StockOperation,
};
use saga::{
    CompensationLog, InMemoryCompensationLog, MockAdapterConfig, MockPaymentAdapter,
    OrderItem, OrderSagaOrchestrator, OrderStatus, PaymentMethod, PaymentStatus, SagaConfig,
    SagaError, SagaStatus, ShippingInfo,
};
use tokio::sync::broadcast;

const WIDGET: ProductId = ProductId::new(1);
const GADGET: ProductId = ProductId::new(2);

/// In-memory ledger whose deductions and releases can be made to fail.
#[derive(Clone, Default)]
struct FlakyLedger {
    inner: Arc<InMemoryInventoryLedger>,
    fail_deduct: Arc<AtomicBool>,
    failing_releases: Arc<AtomicU32>,
}

impl FlakyLedger {
    fn set_fail_on_deduct(&self, fail: bool) {
        self.fail_deduct.store(fail, Ordering::SeqCst);
    }

    /// Makes the next `count` releases time out.
    fn fail_next_releases(&self, count: u32) {
        self.failing_releases.store(count, Ordering::SeqCst);
    }

    fn take_release_failure(&self) -> bool {
        self.failing_releases
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl InventoryLedger for FlakyLedger {
    async fn initialize(
        &self,
        product_id: ProductId,
        quantity: i64,
        actor: &ActorId,
    ) -> inventory::Result<InventoryRecord> {
        self.inner.initialize(product_id, quantity, actor).await
    }

    async fn apply(
        &self,
        op: StockOperation,
        batch: &StockBatch,
        ctx: &MovementContext,
    ) -> inventory::Result<Vec<InventoryRecord>> {
        let fail = match op {
            StockOperation::Deduct => self.fail_deduct.load(Ordering::SeqCst),
            StockOperation::Release => self.take_release_failure(),
            _ => false,
        };
        if fail {
            return Err(InventoryError::LockTimeout {
                product_id: batch.product_ids()[0],
                waited_ms: 3000,
            });
        }
        self.inner.apply(op, batch, ctx).await
    }

    async fn adjust(
        &self,
        product_id: ProductId,
        available: i64,
        reserved: i64,
        ctx: &MovementContext,
    ) -> inventory::Result<InventoryRecord> {
        self.inner.adjust(product_id, available, reserved, ctx).await
    }

    async fn get_inventory(&self, product_id: ProductId) -> inventory::Result<InventoryRecord> {
        self.inner.get_inventory(product_id).await
    }

    async fn movements(
        &self,
        product_id: ProductId,
        page: u32,
        size: u32,
    ) -> inventory::Result<Vec<StockMovement>> {
        self.inner.movements(product_id, page, size).await
    }

    fn subscribe(&self) -> broadcast::Receiver<InventoryUpdate> {
        self.inner.subscribe()
    }
}

struct TestHarness {
    saga: OrderSagaOrchestrator<FlakyLedger, MockPaymentAdapter>,
    ledger: FlakyLedger,
    adapter: MockPaymentAdapter,
    events: InMemoryEventPublisher,
    compensations: Arc<InMemoryCompensationLog>,
}

impl TestHarness {
    async fn new(stock: &[(ProductId, i64)]) -> Self {
        let ledger = FlakyLedger::default();
        for (product, quantity) in stock {
            ledger
                .initialize(*product, *quantity, &ActorId::new("admin"))
                .await
                .unwrap();
        }
        let adapter = MockPaymentAdapter::new(MockAdapterConfig::reliable());
        let events = InMemoryEventPublisher::new();
        let compensations = Arc::new(InMemoryCompensationLog::new());
        let saga = OrderSagaOrchestrator::new(
            ledger.clone(),
            adapter.clone(),
            Arc::new(events.clone()),
            SagaConfig::default(),
        )
        .with_compensation_log(compensations.clone());

        Self {
            saga,
            ledger,
            adapter,
            events,
            compensations,
        }
    }

    async fn levels(&self, product: ProductId) -> (i64, i64, i64) {
        let record = self.ledger.get_inventory(product).await.unwrap();
        (record.available, record.reserved, record.total)
    }

    async fn movement_count(&self, product: ProductId) -> usize {
        self.ledger.movements(product, 0, 100).await.unwrap().len()
    }
}

fn buyer() -> ActorId {
    ActorId::new("buyer-1")
}

fn widgets(quantity: u32) -> Vec<OrderItem> {
    vec![OrderItem::new(
        WIDGET,
        "Widget",
        Money::from_cents(1000),
        quantity,
    )]
}

#[tokio::test]
async fn test_happy_path_reserve_then_deduct() {
    let h = TestHarness::new(&[(WIDGET, 10)]).await;

    let order = h
        .saga
        .create_order(&buyer(), ShippingInfo::default(), widgets(2))
        .await
        .unwrap();
    assert_eq!(h.levels(WIDGET).await, (8, 2, 10));

    let payment = h
        .saga
        .process_payment(&buyer(), &order.order_number, PaymentMethod::Card)
        .await
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Completed);
    assert!(payment.transaction_id.unwrap().starts_with("PG-"));

    assert_eq!(h.levels(WIDGET).await, (8, 0, 8));
    let order = h.saga.get_order(&order.order_number).await.unwrap();
    assert_eq!(order.status, OrderStatus::Paid);

    let saga = h.saga.get_saga(&order.order_number).await.unwrap();
    assert_eq!(saga.status, SagaStatus::Completed);
    assert_eq!(
        h.events.event_types().await,
        vec!["OrderCreated", "PaymentCompleted"]
    );
}

#[tokio::test]
async fn test_insufficient_stock_leaves_order_pending() {
    let h = TestHarness::new(&[(WIDGET, 1)]).await;
    let movements_before = h.movement_count(WIDGET).await;

    let err = h
        .saga
        .create_order(&buyer(), ShippingInfo::default(), widgets(2))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SagaError::Inventory(InventoryError::InsufficientStock { .. })
    ));

    let orders = h.saga.orders_for(&buyer()).await;
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].status, OrderStatus::Pending);
    assert!(!orders[0].stock_reserved);

    assert_eq!(h.levels(WIDGET).await, (1, 0, 1));
    assert_eq!(h.movement_count(WIDGET).await, movements_before);
    assert!(h.events.events().await.is_empty());
}

#[tokio::test]
async fn test_adapter_failure_releases_reservation() {
    let h = TestHarness::new(&[(WIDGET, 10)]).await;
    let order = h
        .saga
        .create_order(&buyer(), ShippingInfo::default(), widgets(3))
        .await
        .unwrap();

    h.adapter.set_decline(Some("CARD_DECLINED"));
    let err = h
        .saga
        .process_payment(&buyer(), &order.order_number, PaymentMethod::Card)
        .await
        .unwrap_err();
    assert!(matches!(err, SagaError::PaymentFailed { .. }));

    let order = h.saga.get_order(&order.order_number).await.unwrap();
    assert_eq!(order.status, OrderStatus::Confirmed);
    assert_eq!(h.levels(WIDGET).await, (10, 0, 10));

    let payments = h.saga.payments_for_order(&order.order_number).await;
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].status, PaymentStatus::Failed);
    assert_eq!(
        payments[0].failure_reason.as_deref(),
        Some("CARD_DECLINED: The card was declined")
    );
    assert_eq!(h.adapter.refund_calls(), 0);
}

#[tokio::test]
async fn test_failure_after_charge_refunds_and_cancels() {
    let h = TestHarness::new(&[(WIDGET, 10)]).await;
    let order = h
        .saga
        .create_order(&buyer(), ShippingInfo::default(), widgets(2))
        .await
        .unwrap();

    h.ledger.set_fail_on_deduct(true);
    let err = h
        .saga
        .process_payment(&buyer(), &order.order_number, PaymentMethod::Card)
        .await
        .unwrap_err();
    assert!(matches!(err, SagaError::OrderCompletionFailed { .. }));

    let payment = h.saga.payments_for_order(&order.order_number).await.remove(0);
    assert_eq!(payment.status, PaymentStatus::Refunded);
    assert!(h.adapter.is_refunded(payment.transaction_id.as_deref().unwrap()));

    let order = h.saga.get_order(&order.order_number).await.unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(h.levels(WIDGET).await, (10, 0, 10));

    let saga = h.saga.get_saga(&order.order_number).await.unwrap();
    assert_eq!(saga.status, SagaStatus::Failed);
    assert!(h.compensations.pending().await.unwrap().is_empty());
    assert_eq!(h.compensations.all().await.len(), 1);

    assert_eq!(
        h.events.event_types().await,
        vec!["OrderCreated", "PaymentRefunded", "OrderCancelled"]
    );
}

#[tokio::test]
async fn test_failed_refund_stays_pending_until_retried() {
    let h = TestHarness::new(&[(WIDGET, 10)]).await;
    let order = h
        .saga
        .create_order(&buyer(), ShippingInfo::default(), widgets(2))
        .await
        .unwrap();

    h.ledger.set_fail_on_deduct(true);
    h.adapter.set_fail_refunds(true);
    let err = h
        .saga
        .process_payment(&buyer(), &order.order_number, PaymentMethod::Card)
        .await
        .unwrap_err();
    assert!(matches!(err, SagaError::CompensationFailed { .. }));
    assert_eq!(h.adapter.refund_calls(), 3);

    let saga = h.saga.get_saga(&order.order_number).await.unwrap();
    assert_eq!(saga.status, SagaStatus::CompensationFailed);
    assert_eq!(saga.compensation_attempts, 3);

    let pending = h.compensations.pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 3);
    assert_eq!(pending[0].amount, Money::from_cents(2000));

    // nothing else may touch the order until the refund goes through
    let err = h
        .saga
        .cancel_order(&buyer(), &order.order_number, "give up")
        .await
        .unwrap_err();
    assert!(matches!(err, SagaError::CompensationFailed { .. }));

    // still failing: stays pending
    assert_eq!(h.saga.retry_pending_compensations().await.unwrap(), 0);
    assert_eq!(h.compensations.pending().await.unwrap()[0].attempts, 4);

    h.adapter.set_fail_refunds(false);
    h.ledger.set_fail_on_deduct(false);
    assert_eq!(h.saga.retry_pending_compensations().await.unwrap(), 1);
    assert!(h.compensations.pending().await.unwrap().is_empty());

    let order = h.saga.get_order(&order.order_number).await.unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(h.levels(WIDGET).await, (10, 0, 10));
    assert_eq!(
        h.saga.get_saga(&order.order_number).await.unwrap().status,
        SagaStatus::Failed
    );
}

#[tokio::test]
async fn test_sweep_continues_past_a_failing_order() {
    let h = TestHarness::new(&[(WIDGET, 10)]).await;
    h.ledger.set_fail_on_deduct(true);
    h.adapter.set_fail_refunds(true);

    let mut numbers = Vec::new();
    for _ in 0..2 {
        let order = h
            .saga
            .create_order(&buyer(), ShippingInfo::default(), widgets(2))
            .await
            .unwrap();
        let err = h
            .saga
            .process_payment(&buyer(), &order.order_number, PaymentMethod::Card)
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::CompensationFailed { .. }));
        numbers.push(order.order_number);
    }
    assert_eq!(h.compensations.pending().await.unwrap().len(), 2);
    assert_eq!(h.levels(WIDGET).await, (6, 4, 10));

    // refunds go through, but the first release the sweep attempts keeps timing out
    h.adapter.set_fail_refunds(false);
    h.ledger.set_fail_on_deduct(false);
    h.ledger.fail_next_releases(3);

    // both refunds, then the stranded reservation on the second pass
    assert_eq!(h.saga.retry_pending_compensations().await.unwrap(), 3);
    assert!(h.compensations.pending().await.unwrap().is_empty());
    assert_eq!(h.levels(WIDGET).await, (10, 0, 10));

    for number in &numbers {
        let order = h.saga.get_order(number).await.unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(
            h.saga.get_saga(number).await.unwrap().status,
            SagaStatus::Failed
        );
        let payment = h.saga.payments_for_order(number).await.remove(0);
        assert_eq!(payment.status, PaymentStatus::Refunded);
    }
}

#[tokio::test]
async fn test_transient_release_failure_is_retried_inline() {
    let h = TestHarness::new(&[(WIDGET, 10)]).await;
    let order = h
        .saga
        .create_order(&buyer(), ShippingInfo::default(), widgets(2))
        .await
        .unwrap();

    h.ledger.fail_next_releases(1);
    h.adapter.set_decline(Some("CARD_DECLINED"));
    let err = h
        .saga
        .process_payment(&buyer(), &order.order_number, PaymentMethod::Card)
        .await
        .unwrap_err();
    assert!(matches!(err, SagaError::PaymentFailed { .. }));

    assert_eq!(h.levels(WIDGET).await, (10, 0, 10));
    assert_eq!(
        h.saga.get_saga(&order.order_number).await.unwrap().status,
        SagaStatus::Failed
    );
}

/// Declines a charge while every inline release attempt times out.
async fn strand_reservation(h: &TestHarness) -> String {
    let order = h
        .saga
        .create_order(&buyer(), ShippingInfo::default(), widgets(2))
        .await
        .unwrap();

    h.ledger.fail_next_releases(3);
    h.adapter.set_decline(Some("CARD_DECLINED"));
    let err = h
        .saga
        .process_payment(&buyer(), &order.order_number, PaymentMethod::Card)
        .await
        .unwrap_err();
    assert!(matches!(err, SagaError::CompensationFailed { .. }));
    h.adapter.set_decline(None);

    assert_eq!(h.levels(WIDGET).await, (8, 2, 10));
    assert_eq!(
        h.saga.get_saga(&order.order_number).await.unwrap().status,
        SagaStatus::CompensationFailed
    );
    assert!(h.compensations.pending().await.unwrap().is_empty());
    order.order_number
}

#[tokio::test]
async fn test_stranded_reservation_does_not_block_retry() {
    let h = TestHarness::new(&[(WIDGET, 10)]).await;
    let order_number = strand_reservation(&h).await;

    let payment = h
        .saga
        .process_payment(&buyer(), &order_number, PaymentMethod::Card)
        .await
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Completed);
    assert_eq!(h.levels(WIDGET).await, (8, 0, 8));
    assert_eq!(
        h.saga.get_saga(&order_number).await.unwrap().status,
        SagaStatus::Completed
    );
}

#[tokio::test]
async fn test_stranded_reservation_can_be_cancelled_once() {
    let h = TestHarness::new(&[(WIDGET, 10)]).await;
    let order_number = strand_reservation(&h).await;

    let order = h
        .saga
        .cancel_order(&buyer(), &order_number, "give up")
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(h.levels(WIDGET).await, (10, 0, 10));

    // nothing left for the sweep to release
    assert_eq!(h.saga.retry_pending_compensations().await.unwrap(), 0);
    assert_eq!(h.levels(WIDGET).await, (10, 0, 10));
    assert_eq!(
        h.saga.get_saga(&order_number).await.unwrap().status,
        SagaStatus::Failed
    );
}

#[tokio::test]
async fn test_sweep_releases_stranded_reservation() {
    let h = TestHarness::new(&[(WIDGET, 10)]).await;
    let order_number = strand_reservation(&h).await;

    assert_eq!(h.saga.retry_pending_compensations().await.unwrap(), 1);
    assert_eq!(h.levels(WIDGET).await, (10, 0, 10));

    let order = h.saga.get_order(&order_number).await.unwrap();
    assert_eq!(order.status, OrderStatus::Confirmed);
    assert!(!order.stock_reserved);
    assert_eq!(
        h.saga.get_saga(&order_number).await.unwrap().status,
        SagaStatus::Failed
    );

    // the order can still be paid, reserving afresh
    h.saga
        .process_payment(&buyer(), &order_number, PaymentMethod::Card)
        .await
        .unwrap();
    assert_eq!(h.levels(WIDGET).await, (8, 0, 8));
}

#[tokio::test]
async fn test_duplicate_items_are_merged_before_reservation() {
    let h = TestHarness::new(&[(WIDGET, 10), (GADGET, 10)]).await;
    let items = vec![
        OrderItem::new(GADGET, "Gadget", Money::from_cents(2500), 1),
        OrderItem::new(WIDGET, "Widget", Money::from_cents(1000), 2),
        OrderItem::new(GADGET, "Gadget", Money::from_cents(2500), 2),
    ];

    let order = h
        .saga
        .create_order(&buyer(), ShippingInfo::default(), items)
        .await
        .unwrap();
    assert_eq!(order.items.len(), 2);
    assert_eq!(order.total_amount, Money::from_cents(9500));
    assert_eq!(h.levels(WIDGET).await, (8, 2, 10));
    assert_eq!(h.levels(GADGET).await, (7, 3, 10));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_payments_charge_once() {
    let h = Arc::new(TestHarness::new(&[(WIDGET, 10)]).await);
    let order = h
        .saga
        .create_order(&buyer(), ShippingInfo::default(), widgets(1))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let h = h.clone();
        let order_number = order.order_number.clone();
        handles.push(tokio::spawn(async move {
            h.saga
                .process_payment(&buyer(), &order_number, PaymentMethod::Card)
                .await
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(SagaError::OrderAlreadyPaid(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(succeeded, 1);
    assert_eq!(h.adapter.charge_calls(), 1);
    assert_eq!(h.levels(WIDGET).await, (9, 0, 9));
}

#[tokio::test]
async fn test_one_order_fails_other_succeeds() {
    let h = TestHarness::new(&[(WIDGET, 3)]).await;
    let first = h
        .saga
        .create_order(&buyer(), ShippingInfo::default(), widgets(2))
        .await
        .unwrap();
    let second = h
        .saga
        .create_order(&ActorId::new("buyer-2"), ShippingInfo::default(), widgets(2))
        .await;
    assert!(second.is_err());

    h.saga
        .process_payment(&buyer(), &first.order_number, PaymentMethod::BankTransfer)
        .await
        .unwrap();
    assert_eq!(h.levels(WIDGET).await, (1, 0, 1));
}
