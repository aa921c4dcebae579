//! Outbound domain events and the write-only sink they are published to.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{ActorId, Money, ProductId};

/// Events published for consumption by unrelated services
/// (notifications, settlement).
///
/// Consumers may only rely on ordering per [`DomainEvent::key`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DomainEvent {
    OrderCreated(OrderCreatedData),
    OrderCancelled(OrderCancelledData),
    PaymentCompleted(PaymentCompletedData),
    PaymentFailed(PaymentFailedData),
    PaymentRefunded(PaymentRefundedData),
    DeliveryShipped(DeliveryShippedData),
    CouponIssued(CouponIssuedData),
    TimeDealStarted(TimeDealStartedData),
}

impl DomainEvent {
    /// Returns the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::OrderCreated(_) => "OrderCreated",
            DomainEvent::OrderCancelled(_) => "OrderCancelled",
            DomainEvent::PaymentCompleted(_) => "PaymentCompleted",
            DomainEvent::PaymentFailed(_) => "PaymentFailed",
            DomainEvent::PaymentRefunded(_) => "PaymentRefunded",
            DomainEvent::DeliveryShipped(_) => "DeliveryShipped",
            DomainEvent::CouponIssued(_) => "CouponIssued",
            DomainEvent::TimeDealStarted(_) => "TimeDealStarted",
        }
    }

    /// Returns the partition key events must be ordered by.
    pub fn key(&self) -> String {
        match self {
            DomainEvent::OrderCreated(d) => d.order_number.clone(),
            DomainEvent::OrderCancelled(d) => d.order_number.clone(),
            DomainEvent::PaymentCompleted(d) => d.order_number.clone(),
            DomainEvent::PaymentFailed(d) => d.order_number.clone(),
            DomainEvent::PaymentRefunded(d) => d.order_number.clone(),
            DomainEvent::DeliveryShipped(d) => d.order_number.clone(),
            DomainEvent::CouponIssued(d) => format!("coupon-{}", d.coupon_id),
            DomainEvent::TimeDealStarted(d) => format!("timedeal-{}", d.deal_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: ProductId,
    pub quantity: u32,
    pub unit_price: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCreatedData {
    pub order_number: String,
    pub actor_id: ActorId,
    pub total_amount: Money,
    pub items: Vec<OrderLine>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCancelledData {
    pub order_number: String,
    pub actor_id: ActorId,
    pub reason: String,
    pub cancelled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentCompletedData {
    pub payment_number: String,
    pub order_number: String,
    pub actor_id: ActorId,
    pub amount: Money,
    pub method: String,
    pub transaction_id: String,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentFailedData {
    pub payment_number: String,
    pub order_number: String,
    pub actor_id: ActorId,
    pub amount: Money,
    pub error_code: String,
    pub message: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRefundedData {
    pub payment_number: String,
    pub order_number: String,
    pub amount: Money,
    pub refund_id: String,
    pub refunded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryShippedData {
    pub order_number: String,
    pub actor_id: ActorId,
    pub shipped_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouponIssuedData {
    pub coupon_id: i64,
    pub coupon_code: String,
    pub grant_id: i64,
    pub actor_id: ActorId,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeDealStartedData {
    pub deal_id: i64,
    pub name: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

/// Write-only sink for outbound events.
///
/// Publishing never fails from the caller's point of view: the sink is
/// responsible for its own delivery and reporting.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: DomainEvent);
}

#[async_trait]
impl<T: EventPublisher + ?Sized> EventPublisher for Arc<T> {
    async fn publish(&self, event: DomainEvent) {
        (**self).publish(event).await
    }
}

/// Publisher that records every event, for tests and inspection.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventPublisher {
    events: Arc<RwLock<Vec<DomainEvent>>>,
}

impl InMemoryEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every event published so far, oldest first.
    pub async fn events(&self) -> Vec<DomainEvent> {
        self.events.read().await.clone()
    }

    /// Returns the type names of the published events, oldest first.
    pub async fn event_types(&self) -> Vec<&'static str> {
        self.events
            .read()
            .await
            .iter()
            .map(DomainEvent::event_type)
            .collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventPublisher {
    async fn publish(&self, event: DomainEvent) {
        self.events.write().await.push(event);
    }
}

/// Publisher that emits each event as a structured log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventPublisher;

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: DomainEvent) {
        match serde_json::to_string(&event) {
            Ok(payload) => tracing::info!(
                event_type = event.event_type(),
                key = %event.key(),
                %payload,
                "event published"
            ),
            Err(e) => tracing::warn!(
                event_type = event.event_type(),
                error = %e,
                "event could not be serialized"
            ),
        }
    }
}
