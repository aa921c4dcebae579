//! Inventory ledger.
//!
//! Owns available/reserved/total stock per product. Stock changes only
//! through the batch operations of [`InventoryLedger`]:
//!
//! - `reserve`: available → reserved
//! - `deduct`: reserved → consumed (total shrinks)
//! - `release`: reserved → available
//! - `add` / `return_stock`: new units into available
//!
//! Every batch locks all of its products in ascending product-id order
//! before mutating any of them, and is all-or-nothing. Each mutation
//! appends a [`StockMovement`] to the audit log.

pub mod batch;
pub mod error;
pub mod ledger;
pub mod memory;
pub mod movement;
pub mod postgres;
pub mod record;

pub use batch::StockBatch;
pub use error::{InventoryError, Result};
pub use ledger::{InventoryLedger, InventoryUpdate, LedgerConfig, StockOperation};
pub use memory::InMemoryInventoryLedger;
pub use movement::{MovementContext, MovementKind, ReferenceType, StockMovement};
pub use postgres::PostgresInventoryLedger;
pub use record::InventoryRecord;
