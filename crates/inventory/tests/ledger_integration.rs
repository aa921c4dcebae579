//! Concurrency tests for the in-memory ledger.

use std::sync::Arc;
use std::time::Duration;

use common::{ActorId, ProductId};
use inventory::{
    InMemoryInventoryLedger, InventoryError, InventoryLedger, LedgerConfig, MovementContext,
    MovementKind, StockBatch,
};

fn pid(id: i64) -> ProductId {
    ProductId::new(id)
}

async fn ledger_with(stock: &[(i64, i64)]) -> Arc<InMemoryInventoryLedger> {
    let ledger = InMemoryInventoryLedger::new(LedgerConfig {
        lock_timeout: Duration::from_secs(5),
        ..LedgerConfig::default()
    });
    for (id, qty) in stock {
        ledger
            .initialize(pid(*id), *qty, &ActorId::new("admin"))
            .await
            .unwrap();
    }
    Arc::new(ledger)
}

fn ctx(order: &str) -> MovementContext {
    MovementContext::order(order, ActorId::new("buyer"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_batches_in_opposite_order_do_not_deadlock() {
    let ledger = ledger_with(&[(1, 10_000), (2, 10_000), (3, 10_000)]).await;

    let mut handles = Vec::new();
    for i in 0..200 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            // Items are added in opposite orders; the batch sorts them.
            let batch = if i % 2 == 0 {
                StockBatch::new().with(pid(1), 1).with(pid(2), 1).with(pid(3), 1)
            } else {
                StockBatch::new().with(pid(3), 1).with(pid(2), 1).with(pid(1), 1)
            };
            ledger.reserve(&batch, &ctx(&format!("ORD-{i}"))).await
        }));
    }

    let all = tokio::time::timeout(Duration::from_secs(10), async {
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    })
    .await;
    assert!(all.is_ok(), "reservations did not complete");

    for id in 1..=3 {
        let record = ledger.get_inventory(pid(id)).await.unwrap();
        assert_eq!(record.available, 10_000 - 200);
        assert_eq!(record.reserved, 200);
        assert_eq!(record.total, record.available + record.reserved);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reservations_never_oversell() {
    let ledger = ledger_with(&[(7, 10)]).await;

    let mut handles = Vec::new();
    for i in 0..50 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger
                .reserve(&StockBatch::single(pid(7), 1), &ctx(&format!("ORD-{i}")))
                .await
        }));
    }

    let mut granted = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => granted += 1,
            Err(InventoryError::InsufficientStock { .. }) => rejected += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(granted, 10);
    assert_eq!(rejected, 40);
    let record = ledger.get_inventory(pid(7)).await.unwrap();
    assert_eq!((record.available, record.reserved), (0, 10));
}

#[tokio::test]
async fn reserve_then_release_restores_exact_levels() {
    let ledger = ledger_with(&[(1, 10), (2, 4)]).await;
    let before_1 = ledger.get_inventory(pid(1)).await.unwrap();
    let before_2 = ledger.get_inventory(pid(2)).await.unwrap();

    let batch = StockBatch::new().with(pid(1), 3).with(pid(2), 4);
    ledger.reserve(&batch, &ctx("ORD-1")).await.unwrap();
    ledger
        .release(&batch, &MovementContext::order_cancel("ORD-1", "cancelled"))
        .await
        .unwrap();

    let after_1 = ledger.get_inventory(pid(1)).await.unwrap();
    let after_2 = ledger.get_inventory(pid(2)).await.unwrap();
    assert_eq!(
        (after_1.available, after_1.reserved, after_1.total),
        (before_1.available, before_1.reserved, before_1.total)
    );
    assert_eq!(
        (after_2.available, after_2.reserved, after_2.total),
        (before_2.available, before_2.reserved, before_2.total)
    );
}

#[tokio::test]
async fn reserve_then_deduct_consumes_stock() {
    let ledger = ledger_with(&[(1, 10)]).await;
    let batch = StockBatch::single(pid(1), 2);

    ledger.reserve(&batch, &ctx("ORD-1")).await.unwrap();
    let record = ledger.get_inventory(pid(1)).await.unwrap();
    assert_eq!((record.available, record.reserved), (8, 2));

    ledger.deduct(&batch, &ctx("ORD-1")).await.unwrap();
    let record = ledger.get_inventory(pid(1)).await.unwrap();
    assert_eq!((record.available, record.reserved, record.total), (8, 0, 8));

    let kinds: Vec<MovementKind> = ledger
        .movements(pid(1), 0, 10)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![MovementKind::Deduct, MovementKind::Reserve, MovementKind::Initial]
    );
}

#[tokio::test]
async fn add_and_return_grow_available_and_total() {
    let ledger = ledger_with(&[(1, 0)]).await;
    let admin = MovementContext::admin(ActorId::new("admin"), "restock");

    ledger
        .add(&StockBatch::single(pid(1), 5), &admin)
        .await
        .unwrap();
    ledger
        .return_stock(
            &StockBatch::single(pid(1), 2),
            &MovementContext::order_cancel("ORD-9", "refund"),
        )
        .await
        .unwrap();

    let record = ledger.get_inventory(pid(1)).await.unwrap();
    assert_eq!((record.available, record.reserved, record.total), (7, 0, 7));
}

#[tokio::test]
async fn shared_ledger_works_through_arc_dyn() {
    let ledger: Arc<dyn InventoryLedger> = ledger_with(&[(1, 3)]).await;
    let records = ledger
        .reserve(&StockBatch::single(pid(1), 3), &ctx("ORD-1"))
        .await
        .unwrap();
    assert_eq!(records[0].available, 0);
}
