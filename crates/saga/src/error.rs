//! Saga error types.

use common::ErrorKind;
use inventory::InventoryError;
use thiserror::Error;

use crate::order::OrderStatus;
use crate::payment::PaymentStatus;

/// Errors that can occur while creating, paying for or settling orders.
#[derive(Debug, Error)]
pub enum SagaError {
    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Payment not found: {0}")]
    PaymentNotFound(String),

    /// An order needs at least one line item.
    #[error("Order has no items")]
    EmptyOrder,

    #[error("Invalid order item: {0}")]
    InvalidItem(String),

    #[error("Invalid discount: {0}")]
    InvalidDiscount(String),

    #[error("Order {0} belongs to another actor")]
    OrderOwnerMismatch(String),

    /// The order's current status does not allow the action.
    #[error("Cannot {action} order {order_number} in status {status}")]
    InvalidOrderStatus {
        order_number: String,
        status: OrderStatus,
        action: &'static str,
    },

    #[error("Order {0} is already paid")]
    OrderAlreadyPaid(String),

    /// The order already has a payment that is not failed or cancelled.
    #[error("Order {0} already has a payment")]
    DuplicatePayment(String),

    #[error("Cannot {action} payment {payment_number} in status {status}")]
    InvalidPaymentStatus {
        payment_number: String,
        status: PaymentStatus,
        action: &'static str,
    },

    /// The payment adapter declined or did not answer in time. Nothing was charged.
    #[error("Payment {payment_number} failed: {error_code} ({message})")]
    PaymentFailed {
        payment_number: String,
        error_code: String,
        message: String,
    },

    /// The charge succeeded but the order could not be completed; the
    /// charge was refunded.
    #[error("Order {order_number} could not be completed: {reason}")]
    OrderCompletionFailed { order_number: String, reason: String },

    #[error("Refund of payment {payment_number} failed: {error_code} ({message})")]
    RefundFailed {
        payment_number: String,
        error_code: String,
        message: String,
    },

    /// Compensation could not finish. Needs manual reconciliation.
    #[error("Compensation failed for saga {saga_id} (order {order_number}): {reason}")]
    CompensationFailed {
        saga_id: String,
        order_number: String,
        reason: String,
    },

    #[error("Inventory error: {0}")]
    Inventory(#[from] InventoryError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl SagaError {
    /// Returns the user-visible class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SagaError::OrderNotFound(_) | SagaError::PaymentNotFound(_) => ErrorKind::NotFound,
            SagaError::EmptyOrder | SagaError::InvalidItem(_) | SagaError::InvalidDiscount(_) => {
                ErrorKind::Invariant
            }
            SagaError::OrderOwnerMismatch(_)
            | SagaError::InvalidOrderStatus { .. }
            | SagaError::OrderAlreadyPaid(_)
            | SagaError::DuplicatePayment(_)
            | SagaError::InvalidPaymentStatus { .. } => ErrorKind::Conflict,
            SagaError::PaymentFailed { .. }
            | SagaError::OrderCompletionFailed { .. }
            | SagaError::RefundFailed { .. } => ErrorKind::Adapter,
            SagaError::Inventory(e) => e.kind(),
            SagaError::CompensationFailed { .. } | SagaError::Database(_) => ErrorKind::Internal,
        }
    }

    /// True when retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SagaError::Inventory(e) if e.is_retryable())
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;

#[cfg(test)]
mod tests {
    use common::ProductId;

    use super::*;

    #[test]
    fn inventory_errors_keep_their_kind() {
        let err = SagaError::from(InventoryError::InsufficientStock {
            product_id: ProductId::new(1),
            requested: 2,
            available: 1,
        });
        assert_eq!(err.kind(), ErrorKind::Capacity);
        assert!(!err.is_retryable());

        let err = SagaError::from(InventoryError::LockTimeout {
            product_id: ProductId::new(1),
            waited_ms: 3000,
        });
        assert!(err.is_retryable());
    }

    #[test]
    fn adapter_failures_are_adapter_kind() {
        let err = SagaError::PaymentFailed {
            payment_number: "PAY-1".into(),
            error_code: "CARD_DECLINED".into(),
            message: "declined".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Adapter);
        assert_eq!(
            err.to_string(),
            "Payment PAY-1 failed: CARD_DECLINED (declined)"
        );
    }
}
