use common::{ActorId, ProductId};
use criterion::{Criterion, criterion_group, criterion_main};
use inventory::{InMemoryInventoryLedger, InventoryLedger, MovementContext, StockBatch};

fn seeded_ledger(rt: &tokio::runtime::Runtime, products: i64) -> InMemoryInventoryLedger {
    rt.block_on(async {
        let ledger = InMemoryInventoryLedger::default();
        for id in 1..=products {
            ledger
                .initialize(ProductId::new(id), 1_000_000_000, &ActorId::new("bench"))
                .await
                .unwrap();
        }
        ledger
    })
}

fn bench_reserve_single_product(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let ledger = seeded_ledger(&rt, 1);
    let batch = StockBatch::single(ProductId::new(1), 1);
    let ctx = MovementContext::order("ORD-BENCH", ActorId::new("bench"));

    c.bench_function("ledger/reserve_single_product", |b| {
        b.iter(|| {
            rt.block_on(async {
                ledger.reserve(&batch, &ctx).await.unwrap();
            });
        });
    });
}

fn bench_reserve_release_five_products(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let ledger = seeded_ledger(&rt, 5);
    let batch: StockBatch = (1..=5).rev().map(|id| (ProductId::new(id), 2)).collect();
    let ctx = MovementContext::order("ORD-BENCH", ActorId::new("bench"));
    let cancel = MovementContext::order_cancel("ORD-BENCH", "bench");

    c.bench_function("ledger/reserve_release_five_products", |b| {
        b.iter(|| {
            rt.block_on(async {
                ledger.reserve(&batch, &ctx).await.unwrap();
                ledger.release(&batch, &cancel).await.unwrap();
            });
        });
    });
}

criterion_group!(
    benches,
    bench_reserve_single_product,
    bench_reserve_release_five_products
);
criterion_main!(benches);
