//! Shared application state and back-end wiring.

use std::sync::Arc;
use std::time::Duration;

use admission::{AdmissionConfig, AdmissionController};
use common::EventPublisher;
use inventory::{InMemoryInventoryLedger, InventoryLedger, LedgerConfig, PostgresInventoryLedger};
use issuer::{
    CounterStore, CouponIssuer, InMemoryCounterStore, IssuanceStore, RedisCounterStore,
    TimeDealService,
};
use saga::{
    CompensationLog, MockAdapterConfig, MockPaymentAdapter, OrderSagaOrchestrator,
    PaymentAdapter, PostgresCompensationLog, SagaConfig,
};
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::StartupError;

pub type SharedLedger = Arc<dyn InventoryLedger>;
pub type SharedCounters = Arc<dyn CounterStore>;
pub type Orchestrator = OrderSagaOrchestrator<SharedLedger, Arc<dyn PaymentAdapter>>;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub ledger: SharedLedger,
    pub saga: Orchestrator,
    pub coupons: CouponIssuer<SharedCounters>,
    pub time_deals: TimeDealService<SharedCounters>,
    pub admission: AdmissionController,
}

/// The pluggable pieces behind an [`AppState`].
pub struct Backends {
    pub ledger: SharedLedger,
    pub counters: SharedCounters,
    pub adapter: Arc<dyn PaymentAdapter>,
    /// `None` keeps the orchestrator's in-memory log.
    pub compensations: Option<Arc<dyn CompensationLog>>,
    pub events: Arc<dyn EventPublisher>,
}

impl Backends {
    /// Everything in process, with the mock adapter tuned by `config`.
    pub fn in_memory(config: &Config, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            ledger: Arc::new(InMemoryInventoryLedger::new(ledger_config(config))),
            counters: Arc::new(InMemoryCounterStore::new()),
            adapter: Arc::new(mock_adapter(config)),
            compensations: None,
            events,
        }
    }

    /// Connects to Postgres and Redis when their URLs are configured,
    /// falling back to the in-memory back-end for each one that is not.
    pub async fn connect(
        config: &Config,
        events: Arc<dyn EventPublisher>,
    ) -> Result<Self, StartupError> {
        let mut backends = Self::in_memory(config, events);

        if let Some(url) = &config.database_url {
            let pool = PgPool::connect(url).await?;
            let ledger = PostgresInventoryLedger::new(pool.clone(), ledger_config(config));
            ledger.run_migrations().await?;
            backends.ledger = Arc::new(ledger);
            backends.compensations = Some(Arc::new(PostgresCompensationLog::new(pool)));
            tracing::info!("using postgres inventory ledger");
        }

        if let Some(url) = &config.redis_url {
            backends.counters = Arc::new(RedisCounterStore::connect(url).await?);
            tracing::info!("using redis counter store");
        }

        Ok(backends)
    }
}

fn ledger_config(config: &Config) -> LedgerConfig {
    LedgerConfig {
        lock_timeout: config.lock_timeout,
        ..LedgerConfig::default()
    }
}

fn mock_adapter(config: &Config) -> MockPaymentAdapter {
    MockPaymentAdapter::new(MockAdapterConfig {
        failure_rate: config.payment_failure_rate,
        min_latency: config.payment_min_latency,
        max_latency: config.payment_max_latency,
    })
}

impl AppState {
    pub fn new(backends: Backends, config: &Config) -> Self {
        let Backends {
            ledger,
            counters,
            adapter,
            compensations,
            events,
        } = backends;

        let saga_config = SagaConfig {
            payment_timeout: config.payment_timeout,
            ..SagaConfig::default()
        };
        let mut saga =
            OrderSagaOrchestrator::new(ledger.clone(), adapter, events.clone(), saga_config);
        if let Some(log) = compensations {
            saga = saga.with_compensation_log(log);
        }

        let store = IssuanceStore::new();
        let admission = AdmissionController::new(AdmissionConfig {
            entry_ttl: config.queue_entry_ttl,
            tick_interval: config.queue_tick,
            ..AdmissionConfig::default()
        });

        Self {
            ledger,
            saga,
            coupons: CouponIssuer::new(store.clone(), counters.clone(), events.clone()),
            time_deals: TimeDealService::new(store, counters, events),
            admission,
        }
    }
}

/// Spawns the admission loop and the pending-refund sweep. Both stop
/// once `shutdown` flips to `true`.
pub fn spawn_workers(
    state: Arc<AppState>,
    retry_interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let admission = state.admission.clone();
    let admission_shutdown = shutdown.clone();
    let admission_loop = tokio::spawn(async move { admission.run(admission_shutdown).await });

    let sweep = tokio::spawn(compensation_sweep(state, retry_interval, shutdown));
    vec![admission_loop, sweep]
}

async fn compensation_sweep(
    state: Arc<AppState>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match state.saga.retry_pending_compensations().await {
                    Ok(0) => {}
                    Ok(resolved) => tracing::info!(resolved, "pending compensations resolved"),
                    Err(e) => tracing::error!(error = %e, "compensation sweep failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("compensation sweep stopped");
}
