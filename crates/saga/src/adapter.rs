//! External payment adapter contract and a mock gateway.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use common::Money;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::payment::PaymentMethod;

/// Outcome of a charge or refund call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterResponse {
    pub success: bool,
    pub transaction_id: Option<String>,
    pub error_code: Option<String>,
    pub message: Option<String>,
}

impl AdapterResponse {
    pub fn success(transaction_id: impl Into<String>) -> Self {
        Self {
            success: true,
            transaction_id: Some(transaction_id.into()),
            error_code: None,
            message: None,
        }
    }

    pub fn failure(error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            transaction_id: None,
            error_code: Some(error_code.into()),
            message: Some(message.into()),
        }
    }

    pub fn error_code(&self) -> &str {
        self.error_code.as_deref().unwrap_or("UNKNOWN")
    }

    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or("no message")
    }
}

/// The payment gateway, seen as a black box.
///
/// Transport problems are reported as unsuccessful responses, never as
/// panics; the orchestrator bounds each call with its own timeout.
#[async_trait]
pub trait PaymentAdapter: Send + Sync {
    async fn charge(
        &self,
        payment_number: &str,
        amount: Money,
        method: PaymentMethod,
    ) -> AdapterResponse;

    async fn refund(&self, transaction_id: &str, amount: Money) -> AdapterResponse;
}

#[async_trait]
impl<T: PaymentAdapter + ?Sized> PaymentAdapter for Arc<T> {
    async fn charge(
        &self,
        payment_number: &str,
        amount: Money,
        method: PaymentMethod,
    ) -> AdapterResponse {
        (**self).charge(payment_number, amount, method).await
    }

    async fn refund(&self, transaction_id: &str, amount: Money) -> AdapterResponse {
        (**self).refund(transaction_id, amount).await
    }
}

/// Decline codes the mock gateway picks from.
pub const ERROR_CODES: [&str; 7] = [
    "CARD_DECLINED",
    "INSUFFICIENT_FUNDS",
    "INVALID_CARD",
    "EXPIRED_CARD",
    "NETWORK_ERROR",
    "TIMEOUT",
    "LIMIT_EXCEEDED",
];

fn error_message(code: &str) -> &'static str {
    match code {
        "CARD_DECLINED" => "The card was declined",
        "INSUFFICIENT_FUNDS" => "Insufficient funds",
        "INVALID_CARD" => "Invalid card details",
        "EXPIRED_CARD" => "The card has expired",
        "NETWORK_ERROR" => "Network error while contacting the issuer",
        "TIMEOUT" => "The issuer did not respond in time",
        "LIMIT_EXCEEDED" => "Card limit exceeded",
        _ => "Payment failed",
    }
}

#[derive(Debug, Clone)]
pub struct MockAdapterConfig {
    /// Probability in `[0, 1]` that a charge is declined.
    pub failure_rate: f64,
    pub min_latency: Duration,
    pub max_latency: Duration,
}

impl Default for MockAdapterConfig {
    fn default() -> Self {
        Self {
            failure_rate: 0.1,
            min_latency: Duration::from_millis(100),
            max_latency: Duration::from_millis(500),
        }
    }
}

impl MockAdapterConfig {
    /// No latency and no random declines.
    pub fn reliable() -> Self {
        Self {
            failure_rate: 0.0,
            min_latency: Duration::ZERO,
            max_latency: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactionStatus {
    Completed,
    Refunded,
}

#[derive(Debug, Clone)]
struct Transaction {
    amount: Money,
    status: TransactionStatus,
}

#[derive(Debug, Default)]
struct MockState {
    transactions: HashMap<String, Transaction>,
    forced_decline: Option<String>,
    fail_refunds: bool,
    charge_calls: usize,
    refund_calls: usize,
}

/// Simulated gateway with random declines and latency, plus fault
/// injection for tests.
#[derive(Debug, Clone, Default)]
pub struct MockPaymentAdapter {
    config: MockAdapterConfig,
    state: Arc<Mutex<MockState>>,
}

impl MockPaymentAdapter {
    pub fn new(config: MockAdapterConfig) -> Self {
        Self {
            config,
            state: Arc::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declines every charge with `code` until cleared with `None`.
    pub fn set_decline(&self, code: Option<&str>) {
        self.state().forced_decline = code.map(str::to_string);
    }

    /// Fails every refund until cleared.
    pub fn set_fail_refunds(&self, fail: bool) {
        self.state().fail_refunds = fail;
    }

    pub fn charge_calls(&self) -> usize {
        self.state().charge_calls
    }

    pub fn refund_calls(&self) -> usize {
        self.state().refund_calls
    }

    /// True if the transaction exists and has been refunded.
    pub fn is_refunded(&self, transaction_id: &str) -> bool {
        self.state()
            .transactions
            .get(transaction_id)
            .is_some_and(|tx| tx.status == TransactionStatus::Refunded)
    }

    fn latency(&self) -> Duration {
        if self.config.max_latency <= self.config.min_latency {
            return self.config.min_latency;
        }
        rand::thread_rng().gen_range(self.config.min_latency..=self.config.max_latency)
    }

    fn random_decline(&self) -> Option<&'static str> {
        let mut rng = rand::thread_rng();
        if rng.gen_bool(self.config.failure_rate.clamp(0.0, 1.0)) {
            Some(ERROR_CODES[rng.gen_range(0..ERROR_CODES.len())])
        } else {
            None
        }
    }

    fn transaction_id() -> String {
        format!("PG-{}", &Uuid::new_v4().simple().to_string()[..12].to_uppercase())
    }
}

#[async_trait]
impl PaymentAdapter for MockPaymentAdapter {
    async fn charge(
        &self,
        payment_number: &str,
        amount: Money,
        method: PaymentMethod,
    ) -> AdapterResponse {
        let latency = self.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let random = self.random_decline();
        let mut state = self.state();
        state.charge_calls += 1;

        if let Some(code) = state.forced_decline.clone().or(random.map(str::to_string)) {
            tracing::info!(
                payment_number,
                %amount,
                method = method.as_str(),
                code = %code,
                "mock charge declined"
            );
            let message = error_message(&code);
            return AdapterResponse::failure(code, message);
        }

        let transaction_id = Self::transaction_id();
        state.transactions.insert(
            transaction_id.clone(),
            Transaction {
                amount,
                status: TransactionStatus::Completed,
            },
        );
        tracing::info!(payment_number, %amount, %transaction_id, "mock charge approved");
        AdapterResponse::success(transaction_id)
    }

    async fn refund(&self, transaction_id: &str, amount: Money) -> AdapterResponse {
        let latency = self.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        state.refund_calls += 1;

        if state.fail_refunds {
            return AdapterResponse::failure("NETWORK_ERROR", error_message("NETWORK_ERROR"));
        }
        let Some(tx) = state.transactions.get_mut(transaction_id) else {
            return AdapterResponse::failure("TX_NOT_FOUND", "Transaction not found");
        };
        if tx.status != TransactionStatus::Completed {
            return AdapterResponse::failure("INVALID_STATUS", "Transaction is not refundable");
        }
        if amount > tx.amount {
            return AdapterResponse::failure(
                "INVALID_AMOUNT",
                "Refund amount exceeds the charged amount",
            );
        }

        tx.status = TransactionStatus::Refunded;
        AdapterResponse::success(format!("RF-{transaction_id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> MockPaymentAdapter {
        MockPaymentAdapter::new(MockAdapterConfig::reliable())
    }

    #[tokio::test]
    async fn test_charge_then_refund() {
        let adapter = adapter();
        let charge = adapter
            .charge("PAY-1", Money::from_cents(1000), PaymentMethod::Card)
            .await;
        assert!(charge.success);
        let tx = charge.transaction_id.unwrap();
        assert!(tx.starts_with("PG-"));
        assert_eq!(tx.len(), 15);

        let refund = adapter.refund(&tx, Money::from_cents(1000)).await;
        assert!(refund.success);
        assert_eq!(refund.transaction_id, Some(format!("RF-{tx}")));
        assert!(adapter.is_refunded(&tx));

        let again = adapter.refund(&tx, Money::from_cents(1000)).await;
        assert_eq!(again.error_code(), "INVALID_STATUS");
    }

    #[tokio::test]
    async fn test_refund_rejections() {
        let adapter = adapter();
        let missing = adapter.refund("PG-NOPE", Money::from_cents(1)).await;
        assert_eq!(missing.error_code(), "TX_NOT_FOUND");

        let charge = adapter
            .charge("PAY-1", Money::from_cents(500), PaymentMethod::Card)
            .await;
        let tx = charge.transaction_id.unwrap();
        let too_much = adapter.refund(&tx, Money::from_cents(501)).await;
        assert_eq!(too_much.error_code(), "INVALID_AMOUNT");
    }

    #[tokio::test]
    async fn test_forced_decline() {
        let adapter = adapter();
        adapter.set_decline(Some("CARD_DECLINED"));
        let response = adapter
            .charge("PAY-1", Money::from_cents(500), PaymentMethod::Card)
            .await;
        assert!(!response.success);
        assert_eq!(response.error_code(), "CARD_DECLINED");
        assert_eq!(response.message(), "The card was declined");

        adapter.set_decline(None);
        let response = adapter
            .charge("PAY-2", Money::from_cents(500), PaymentMethod::Card)
            .await;
        assert!(response.success);
        assert_eq!(adapter.charge_calls(), 2);
    }

    #[tokio::test]
    async fn test_always_failing_gateway() {
        let adapter = MockPaymentAdapter::new(MockAdapterConfig {
            failure_rate: 1.0,
            ..MockAdapterConfig::reliable()
        });
        let response = adapter
            .charge("PAY-1", Money::from_cents(500), PaymentMethod::Mobile)
            .await;
        assert!(!response.success);
        assert!(ERROR_CODES.contains(&response.error_code()));
    }
}
