//! Multi-product quantity map.

use std::collections::BTreeMap;

use common::ProductId;
use serde::{Deserialize, Serialize};

use crate::error::{InventoryError, Result};

/// Product → quantity map for one all-or-nothing ledger operation.
///
/// Backed by a `BTreeMap`, so iteration is always in ascending product-id
/// order, which is the lock order. Adding the same product twice sums
/// the quantities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StockBatch(BTreeMap<ProductId, i64>);

impl StockBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a batch for a single product.
    pub fn single(product_id: ProductId, quantity: i64) -> Self {
        Self::new().with(product_id, quantity)
    }

    /// Builder form of [`StockBatch::add`].
    pub fn with(mut self, product_id: ProductId, quantity: i64) -> Self {
        self.add(product_id, quantity);
        self
    }

    /// Adds `quantity` for `product_id`, merging with any existing entry.
    pub fn add(&mut self, product_id: ProductId, quantity: i64) {
        *self.0.entry(product_id).or_insert(0) += quantity;
    }

    /// Returns the quantity recorded for a product.
    pub fn quantity(&self, product_id: ProductId) -> Option<i64> {
        self.0.get(&product_id).copied()
    }

    /// Iterates `(product, quantity)` pairs in ascending product order.
    pub fn iter(&self) -> impl Iterator<Item = (ProductId, i64)> + '_ {
        self.0.iter().map(|(id, qty)| (*id, *qty))
    }

    /// Returns the product ids in ascending order.
    pub fn product_ids(&self) -> Vec<ProductId> {
        self.0.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Rejects empty batches and non-positive quantities.
    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(InventoryError::EmptyBatch);
        }
        match self.0.values().find(|qty| **qty <= 0) {
            Some(quantity) => Err(InventoryError::InvalidQuantity {
                quantity: *quantity,
            }),
            None => Ok(()),
        }
    }
}

impl FromIterator<(ProductId, i64)> for StockBatch {
    fn from_iter<I: IntoIterator<Item = (ProductId, i64)>>(iter: I) -> Self {
        let mut batch = StockBatch::new();
        for (product_id, quantity) in iter {
            batch.add(product_id, quantity);
        }
        batch
    }
}
