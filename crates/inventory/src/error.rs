//! Inventory ledger error types.

use common::{ErrorKind, ProductId};
use thiserror::Error;

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
pub enum InventoryError {
    /// Quantity argument was zero or negative.
    #[error("Invalid stock quantity: {quantity}")]
    InvalidQuantity { quantity: i64 },

    /// A batch operation was called with no products.
    #[error("Stock batch is empty")]
    EmptyBatch,

    /// Not enough available stock to reserve.
    #[error("Insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: ProductId,
        requested: i64,
        available: i64,
    },

    /// Deduct requested more than is reserved.
    #[error("Stock deduction failed for product {product_id}: requested {requested}, reserved {reserved}")]
    DeductionFailed {
        product_id: ProductId,
        requested: i64,
        reserved: i64,
    },

    /// Release requested more than is reserved.
    #[error("Stock release failed for product {product_id}: requested {requested}, reserved {reserved}")]
    ReleaseFailed {
        product_id: ProductId,
        requested: i64,
        reserved: i64,
    },

    /// No inventory record exists for the product.
    #[error("Inventory not found for product {product_id}")]
    NotFound { product_id: ProductId },

    /// The product already has an inventory record.
    #[error("Inventory already initialized for product {product_id}")]
    AlreadyInitialized { product_id: ProductId },

    /// A competing operation held the product's lock past the lock timeout.
    #[error("Timed out after {waited_ms}ms waiting for the lock on product {product_id}")]
    LockTimeout { product_id: ProductId, waited_ms: u64 },

    /// The record changed underneath a locked update.
    #[error("Version conflict on product {product_id}: expected {expected}")]
    VersionConflict { product_id: ProductId, expected: i64 },

    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl InventoryError {
    /// Returns the user-visible class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            InventoryError::InsufficientStock { .. } | InventoryError::LockTimeout { .. } => {
                ErrorKind::Capacity
            }
            InventoryError::AlreadyInitialized { .. } | InventoryError::VersionConflict { .. } => {
                ErrorKind::Conflict
            }
            InventoryError::InvalidQuantity { .. }
            | InventoryError::EmptyBatch
            | InventoryError::DeductionFailed { .. }
            | InventoryError::ReleaseFailed { .. } => ErrorKind::Invariant,
            InventoryError::NotFound { .. } => ErrorKind::NotFound,
            InventoryError::Database(_) => ErrorKind::Internal,
        }
    }

    /// Returns true if the caller may retry the same operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            InventoryError::LockTimeout { .. } | InventoryError::VersionConflict { .. }
        )
    }
}

/// Convenience type alias for ledger results.
pub type Result<T> = std::result::Result<T, InventoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_timeout_is_retryable_capacity_error() {
        let err = InventoryError::LockTimeout {
            product_id: ProductId::new(1),
            waited_ms: 3000,
        };
        assert_eq!(err.kind(), ErrorKind::Capacity);
        assert!(err.is_retryable());
    }

    #[test]
    fn mismatched_release_is_an_invariant_violation() {
        let err = InventoryError::ReleaseFailed {
            product_id: ProductId::new(1),
            requested: 5,
            reserved: 2,
        };
        assert_eq!(err.kind(), ErrorKind::Invariant);
        assert!(!err.is_retryable());
    }
}
