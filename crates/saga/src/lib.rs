//! Order-payment saga.
//!
//! An order moves through these steps:
//! 1. Reserve inventory
//! 2. Confirm the order
//! 3. Process payment
//! 4. Deduct the reserved inventory
//! 5. Complete the order
//!
//! If a step fails, the steps still in effect are compensated in reverse
//! order using the table in [`steps`]. A refund owed after a successful
//! charge is written to a [`CompensationLog`] first, so it is never lost.

pub mod adapter;
pub mod compensation;
pub mod error;
pub mod order;
pub mod orchestrator;
pub mod payment;
pub mod repository;
pub mod state;
pub mod steps;

pub use adapter::{AdapterResponse, MockAdapterConfig, MockPaymentAdapter, PaymentAdapter};
pub use compensation::{
    CompensationLog, InMemoryCompensationLog, PendingCompensation, PostgresCompensationLog,
};
pub use error::{Result, SagaError};
pub use order::{Order, OrderItem, OrderStatus, ShippingInfo};
pub use orchestrator::{OrderSagaOrchestrator, SagaConfig};
pub use payment::{Payment, PaymentMethod, PaymentStatus};
pub use state::{SagaState, SagaStatus};
pub use steps::{Compensation, SagaStep, compensation_for, plan_compensations};
