//! PostgreSQL compensation log tests
//!
//! These tests use a shared PostgreSQL container and need Docker.
//! Run with:
//!
//! ```bash
//! cargo test -p saga --test postgres_compensation -- --ignored --test-threads=1
//! ```

use std::sync::Arc;

use common::{ActorId, Money};
use saga::{CompensationLog, Payment, PaymentMethod, PendingCompensation, PostgresCompensationLog};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();
            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();
            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/002_create_pending_compensations.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn get_test_log() -> PostgresCompensationLog {
    let info = get_container_info().await;
    let pool = PgPool::connect(&info.connection_string).await.unwrap();
    sqlx::query("TRUNCATE pending_compensations")
        .execute(&pool)
        .await
        .unwrap();
    PostgresCompensationLog::new(pool)
}

fn completed_payment(order_number: &str, cents: i64) -> Payment {
    let mut payment = Payment::new(
        order_number,
        ActorId::new("buyer"),
        Money::from_cents(cents),
        PaymentMethod::Card,
    );
    payment.start_processing().unwrap();
    payment.complete(format!("PG-{order_number}")).unwrap();
    payment
}

#[tokio::test]
#[serial]
#[ignore = "requires docker"]
async fn test_pending_refund_round_trip() {
    let log = get_test_log().await;
    let entry =
        PendingCompensation::refund("SAGA-1", &completed_payment("ORD-1", 4200)).unwrap();
    log.record(&entry).await.unwrap();

    log.record_failure(entry.id, "NETWORK_ERROR: timeout")
        .await
        .unwrap();
    log.record_failure(entry.id, "NETWORK_ERROR: reset")
        .await
        .unwrap();

    let pending = log.pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, entry.id);
    assert_eq!(pending[0].transaction_id, "PG-ORD-1");
    assert_eq!(pending[0].amount, Money::from_cents(4200));
    assert_eq!(pending[0].attempts, 2);
    assert_eq!(pending[0].last_error.as_deref(), Some("NETWORK_ERROR: reset"));

    log.resolve(entry.id).await.unwrap();
    assert!(log.pending().await.unwrap().is_empty());
}

#[tokio::test]
#[serial]
#[ignore = "requires docker"]
async fn test_pending_is_oldest_first() {
    let log = get_test_log().await;
    let first = PendingCompensation::refund("SAGA-1", &completed_payment("ORD-1", 100)).unwrap();
    let mut second =
        PendingCompensation::refund("SAGA-2", &completed_payment("ORD-2", 200)).unwrap();
    second.created_at = first.created_at + chrono::Duration::seconds(1);

    log.record(&second).await.unwrap();
    log.record(&first).await.unwrap();

    let pending = log.pending().await.unwrap();
    let orders: Vec<&str> = pending.iter().map(|e| e.order_number.as_str()).collect();
    assert_eq!(orders, vec!["ORD-1", "ORD-2"]);
}
