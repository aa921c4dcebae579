//! Per-product stock record.

use chrono::{DateTime, Utc};
use common::ProductId;
use serde::{Deserialize, Serialize};

use crate::error::{InventoryError, Result};

/// Stock levels for a single product.
///
/// `total == available + reserved` holds after every operation except
/// `deduct`, which consumes reserved units and shrinks `total` with them.
/// `version` increases by one on every mutation.
///
/// The mutators are crate-private: outside the ledger a record is a
/// read-only snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub product_id: ProductId,
    pub available: i64,
    pub reserved: i64,
    pub total: i64,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

fn ensure_positive(quantity: i64) -> Result<()> {
    if quantity <= 0 {
        return Err(InventoryError::InvalidQuantity { quantity });
    }
    Ok(())
}

impl InventoryRecord {
    /// Creates the record for a product's initial stock.
    pub(crate) fn initial(product_id: ProductId, quantity: i64) -> Result<Self> {
        if quantity < 0 {
            return Err(InventoryError::InvalidQuantity { quantity });
        }
        Ok(Self {
            product_id,
            available: quantity,
            reserved: 0,
            total: quantity,
            version: 0,
            updated_at: Utc::now(),
        })
    }

    pub(crate) fn reserve(&mut self, quantity: i64) -> Result<()> {
        ensure_positive(quantity)?;
        if self.available < quantity {
            return Err(InventoryError::InsufficientStock {
                product_id: self.product_id,
                requested: quantity,
                available: self.available,
            });
        }
        self.available -= quantity;
        self.reserved += quantity;
        self.touch();
        Ok(())
    }

    pub(crate) fn deduct(&mut self, quantity: i64) -> Result<()> {
        ensure_positive(quantity)?;
        if self.reserved < quantity {
            return Err(InventoryError::DeductionFailed {
                product_id: self.product_id,
                requested: quantity,
                reserved: self.reserved,
            });
        }
        self.reserved -= quantity;
        self.total -= quantity;
        self.touch();
        Ok(())
    }

    pub(crate) fn release(&mut self, quantity: i64) -> Result<()> {
        ensure_positive(quantity)?;
        if self.reserved < quantity {
            return Err(InventoryError::ReleaseFailed {
                product_id: self.product_id,
                requested: quantity,
                reserved: self.reserved,
            });
        }
        self.reserved -= quantity;
        self.available += quantity;
        self.touch();
        Ok(())
    }

    /// Restock or customer return.
    pub(crate) fn add(&mut self, quantity: i64) -> Result<()> {
        ensure_positive(quantity)?;
        let (Some(available), Some(total)) = (
            self.available.checked_add(quantity),
            self.total.checked_add(quantity),
        ) else {
            return Err(InventoryError::InvalidQuantity { quantity });
        };
        self.available = available;
        self.total = total;
        self.touch();
        Ok(())
    }

    /// Admin correction of both counters.
    pub(crate) fn adjust(&mut self, available: i64, reserved: i64) -> Result<()> {
        if available < 0 {
            return Err(InventoryError::InvalidQuantity {
                quantity: available,
            });
        }
        if reserved < 0 {
            return Err(InventoryError::InvalidQuantity { quantity: reserved });
        }
        let total = available
            .checked_add(reserved)
            .ok_or(InventoryError::InvalidQuantity { quantity: reserved })?;
        self.available = available;
        self.reserved = reserved;
        self.total = total;
        self.touch();
        Ok(())
    }

    fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }
}
