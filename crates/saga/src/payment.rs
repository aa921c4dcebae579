//! Payments and their status machine.

use chrono::{DateTime, Utc};
use common::{ActorId, Money, short_code};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SagaError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    Card,
    BankTransfer,
    VirtualAccount,
    Mobile,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Card => "CARD",
            PaymentMethod::BankTransfer => "BANK_TRANSFER",
            PaymentMethod::VirtualAccount => "VIRTUAL_ACCOUNT",
            PaymentMethod::Mobile => "MOBILE",
        }
    }
}

/// Payment status.
///
/// ```text
/// PENDING → PROCESSING → COMPLETED | FAILED
/// PENDING | PROCESSING → CANCELLED
/// COMPLETED → REFUNDED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Processing => "PROCESSING",
            PaymentStatus::Completed => "COMPLETED",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Cancelled => "CANCELLED",
            PaymentStatus::Refunded => "REFUNDED",
        }
    }

    /// Whether a payment in this status prevents another payment for the
    /// same order. Failed and cancelled attempts may be retried.
    pub fn blocks_new_payment(&self) -> bool {
        !matches!(self, PaymentStatus::Failed | PaymentStatus::Cancelled)
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub payment_number: String,
    pub order_number: String,
    pub actor: ActorId,
    pub amount: Money,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub transaction_id: Option<String>,
    pub failure_reason: Option<String>,
    pub refund_id: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    pub fn new(
        order_number: impl Into<String>,
        actor: ActorId,
        amount: Money,
        method: PaymentMethod,
    ) -> Self {
        let now = Utc::now();
        Self {
            payment_number: format!("PAY-{}", short_code()),
            order_number: order_number.into(),
            actor,
            amount,
            method,
            status: PaymentStatus::Pending,
            transaction_id: None,
            failure_reason: None,
            refund_id: None,
            paid_at: None,
            refunded_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn transition(
        &mut self,
        action: &'static str,
        allowed: impl Fn(PaymentStatus) -> bool,
        to: PaymentStatus,
    ) -> Result<()> {
        if !allowed(self.status) {
            return Err(SagaError::InvalidPaymentStatus {
                payment_number: self.payment_number.clone(),
                status: self.status,
                action,
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn start_processing(&mut self) -> Result<()> {
        self.transition(
            "process",
            |s| s == PaymentStatus::Pending,
            PaymentStatus::Processing,
        )
    }

    pub fn complete(&mut self, transaction_id: impl Into<String>) -> Result<()> {
        self.transition(
            "complete",
            |s| s == PaymentStatus::Processing,
            PaymentStatus::Completed,
        )?;
        self.transaction_id = Some(transaction_id.into());
        self.paid_at = Some(self.updated_at);
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(
            "fail",
            |s| matches!(s, PaymentStatus::Pending | PaymentStatus::Processing),
            PaymentStatus::Failed,
        )?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(
            "cancel",
            |s| matches!(s, PaymentStatus::Pending | PaymentStatus::Processing),
            PaymentStatus::Cancelled,
        )?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    pub fn refund(&mut self, refund_id: impl Into<String>) -> Result<()> {
        self.transition(
            "refund",
            |s| s == PaymentStatus::Completed,
            PaymentStatus::Refunded,
        )?;
        self.refund_id = Some(refund_id.into());
        self.refunded_at = Some(self.updated_at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payment() -> Payment {
        Payment::new(
            "ORD-1",
            ActorId::new("buyer"),
            Money::from_cents(1000),
            PaymentMethod::Card,
        )
    }

    #[test]
    fn completes_then_refunds() {
        let mut p = payment();
        assert!(p.payment_number.starts_with("PAY-"));
        assert_eq!(p.payment_number.len(), 12);

        p.start_processing().unwrap();
        p.complete("PG-ABC").unwrap();
        assert_eq!(p.transaction_id.as_deref(), Some("PG-ABC"));
        assert!(p.paid_at.is_some());

        p.refund("RF-PG-ABC").unwrap();
        assert_eq!(p.status, PaymentStatus::Refunded);
        assert!(p.refund("again").is_err());
    }

    #[test]
    fn complete_requires_processing() {
        let mut p = payment();
        let err = p.complete("PG-1").unwrap_err();
        assert!(matches!(
            err,
            SagaError::InvalidPaymentStatus {
                status: PaymentStatus::Pending,
                ..
            }
        ));
    }

    #[test]
    fn failed_payment_records_reason_and_cannot_refund() {
        let mut p = payment();
        p.start_processing().unwrap();
        p.fail("CARD_DECLINED: declined").unwrap();
        assert_eq!(p.failure_reason.as_deref(), Some("CARD_DECLINED: declined"));
        assert!(p.refund("RF-1").is_err());
        assert!(!p.status.blocks_new_payment());
    }

    #[test]
    fn completed_payment_cannot_fail_or_cancel() {
        let mut p = payment();
        p.start_processing().unwrap();
        p.complete("PG-1").unwrap();
        assert!(p.fail("late").is_err());
        assert!(p.cancel("late").is_err());
        assert!(p.status.blocks_new_payment());
    }
}
