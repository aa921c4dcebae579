//! Orders and their status machine.

use chrono::{DateTime, Utc};
use common::events::OrderLine;
use common::{ActorId, Money, ProductId, short_code};
use inventory::StockBatch;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SagaError};

/// Order status.
///
/// ```text
/// PENDING → CONFIRMED → PAID → SHIPPING → DELIVERED
/// PENDING | CONFIRMED | PAID → CANCELLED
/// PAID | SHIPPING → REFUNDED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Paid,
    Shipping,
    Delivered,
    Cancelled,
    Refunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Confirmed => "CONFIRMED",
            OrderStatus::Paid => "PAID",
            OrderStatus::Shipping => "SHIPPING",
            OrderStatus::Delivered => "DELIVERED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Refunded => "REFUNDED",
        }
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending | OrderStatus::Confirmed | OrderStatus::Paid
        )
    }

    pub fn is_refundable(&self) -> bool {
        matches!(self, OrderStatus::Paid | OrderStatus::Shipping)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of an order, priced when it was added.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: ProductId,
    pub product_name: String,
    pub unit_price: Money,
    pub quantity: u32,
}

impl OrderItem {
    pub fn new(
        product_id: ProductId,
        product_name: impl Into<String>,
        unit_price: Money,
        quantity: u32,
    ) -> Self {
        Self {
            product_id,
            product_name: product_name.into(),
            unit_price,
            quantity,
        }
    }

    /// Price times quantity. `None` if it does not fit in an amount.
    pub fn subtotal(&self) -> Option<Money> {
        self.unit_price.checked_multiply(i64::from(self.quantity))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ShippingInfo {
    pub recipient: String,
    pub phone: String,
    pub address: String,
    pub postal_code: String,
}

/// An order and the state the saga keeps about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub order_number: String,
    pub actor: ActorId,
    pub status: OrderStatus,
    pub items: Vec<OrderItem>,
    pub total_amount: Money,
    pub discount: Money,
    pub final_amount: Money,
    pub shipping: ShippingInfo,
    /// True while a reservation for this order's items is held.
    pub stock_reserved: bool,
    pub cancel_reason: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Creates a PENDING order. Lines for the same product are merged.
    pub fn new(actor: ActorId, shipping: ShippingInfo, items: Vec<OrderItem>) -> Result<Self> {
        if items.is_empty() {
            return Err(SagaError::EmptyOrder);
        }

        let mut merged: Vec<OrderItem> = Vec::with_capacity(items.len());
        for item in items {
            if item.quantity == 0 {
                return Err(SagaError::InvalidItem(format!(
                    "quantity of product {} must be positive",
                    item.product_id
                )));
            }
            if item.unit_price.cents() < 0 {
                return Err(SagaError::InvalidItem(format!(
                    "price of product {} is negative",
                    item.product_id
                )));
            }
            match merged.iter_mut().find(|m| m.product_id == item.product_id) {
                Some(existing) => {
                    existing.quantity =
                        existing.quantity.checked_add(item.quantity).ok_or_else(|| {
                            SagaError::InvalidItem(format!(
                                "quantity of product {} is too large",
                                item.product_id
                            ))
                        })?;
                }
                None => merged.push(item),
            }
        }

        let mut total_amount = Money::zero();
        for item in &merged {
            total_amount = item
                .subtotal()
                .and_then(|subtotal| total_amount.checked_add(subtotal))
                .ok_or_else(|| {
                    SagaError::InvalidItem(format!(
                        "order total overflows at product {}",
                        item.product_id
                    ))
                })?;
        }
        let now = Utc::now();
        Ok(Self {
            order_number: Self::generate_number(now),
            actor,
            status: OrderStatus::Pending,
            items: merged,
            total_amount,
            discount: Money::zero(),
            final_amount: total_amount,
            shipping,
            stock_reserved: false,
            cancel_reason: None,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// `ORD-YYYYMMDD-XXXXXXXX`
    fn generate_number(now: DateTime<Utc>) -> String {
        format!("ORD-{}-{}", now.format("%Y%m%d"), short_code())
    }

    /// The quantities to reserve, deduct or release for this order.
    pub fn stock_batch(&self) -> StockBatch {
        self.items
            .iter()
            .map(|item| (item.product_id, i64::from(item.quantity)))
            .collect()
    }

    pub fn lines(&self) -> Vec<OrderLine> {
        self.items
            .iter()
            .map(|item| OrderLine {
                product_id: item.product_id,
                quantity: item.quantity,
                unit_price: item.unit_price,
            })
            .collect()
    }

    pub fn is_owned_by(&self, actor: &ActorId) -> bool {
        &self.actor == actor
    }

    fn transition(
        &mut self,
        action: &'static str,
        allowed: impl Fn(OrderStatus) -> bool,
        to: OrderStatus,
    ) -> Result<()> {
        if !allowed(self.status) {
            return Err(SagaError::InvalidOrderStatus {
                order_number: self.order_number.clone(),
                status: self.status,
                action,
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn confirm(&mut self) -> Result<()> {
        self.transition(
            "confirm",
            |s| s == OrderStatus::Pending,
            OrderStatus::Confirmed,
        )
    }

    pub fn mark_paid(&mut self) -> Result<()> {
        self.transition("pay", |s| s == OrderStatus::Confirmed, OrderStatus::Paid)
    }

    pub fn ship(&mut self) -> Result<()> {
        self.transition("ship", |s| s == OrderStatus::Paid, OrderStatus::Shipping)
    }

    pub fn deliver(&mut self) -> Result<()> {
        self.transition(
            "deliver",
            |s| s == OrderStatus::Shipping,
            OrderStatus::Delivered,
        )
    }

    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition("cancel", |s| s.is_cancellable(), OrderStatus::Cancelled)?;
        self.cancel_reason = Some(reason.into());
        self.cancelled_at = Some(self.updated_at);
        Ok(())
    }

    pub fn refund(&mut self) -> Result<()> {
        self.transition("refund", |s| s.is_refundable(), OrderStatus::Refunded)
    }

    /// Applies a discount before payment. The charged amount never goes
    /// below zero.
    pub fn apply_discount(&mut self, discount: Money) -> Result<()> {
        if !matches!(self.status, OrderStatus::Pending | OrderStatus::Confirmed) {
            return Err(SagaError::InvalidOrderStatus {
                order_number: self.order_number.clone(),
                status: self.status,
                action: "discount",
            });
        }
        if discount.cents() < 0 {
            return Err(SagaError::InvalidDiscount(format!(
                "discount {discount} is negative"
            )));
        }
        let discount = discount.min(self.total_amount);
        self.discount = discount;
        self.final_amount = self.total_amount - discount;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Drops the discount of an unpaid order.
    pub fn clear_discount(&mut self) -> Result<()> {
        if matches!(self.status, OrderStatus::Pending | OrderStatus::Confirmed)
            && self.discount != Money::zero()
        {
            self.discount = Money::zero();
            self.final_amount = self.total_amount;
            self.updated_at = Utc::now();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(product: i64, price: i64, quantity: u32) -> OrderItem {
        OrderItem::new(
            ProductId::new(product),
            format!("product {product}"),
            Money::from_cents(price),
            quantity,
        )
    }

    fn order(items: Vec<OrderItem>) -> Order {
        Order::new(ActorId::new("buyer"), ShippingInfo::default(), items).unwrap()
    }

    #[test]
    fn merges_lines_for_the_same_product() {
        let order = order(vec![item(2, 500, 1), item(1, 1000, 2), item(2, 500, 3)]);

        assert_eq!(order.items.len(), 2);
        assert_eq!(order.items[0].product_id, ProductId::new(2));
        assert_eq!(order.items[0].quantity, 4);
        assert_eq!(order.total_amount, Money::from_cents(4000));
        assert_eq!(order.final_amount, order.total_amount);

        let batch = order.stock_batch();
        assert_eq!(batch.quantity(ProductId::new(1)), Some(2));
        assert_eq!(batch.quantity(ProductId::new(2)), Some(4));
    }

    #[test]
    fn rejects_empty_and_zero_quantity_orders() {
        let actor = ActorId::new("buyer");
        assert!(matches!(
            Order::new(actor.clone(), ShippingInfo::default(), vec![]),
            Err(SagaError::EmptyOrder)
        ));
        assert!(matches!(
            Order::new(actor, ShippingInfo::default(), vec![item(1, 100, 0)]),
            Err(SagaError::InvalidItem(_))
        ));
    }

    #[test]
    fn order_number_format() {
        let order = order(vec![item(1, 100, 1)]);
        let parts: Vec<&str> = order.order_number.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "ORD");
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 8);
    }

    #[test]
    fn happy_path_transitions() {
        let mut order = order(vec![item(1, 100, 1)]);
        order.confirm().unwrap();
        order.mark_paid().unwrap();
        order.ship().unwrap();
        order.deliver().unwrap();
        assert_eq!(order.status, OrderStatus::Delivered);
    }

    #[test]
    fn rejects_out_of_order_transitions() {
        let mut order = order(vec![item(1, 100, 1)]);
        let err = order.mark_paid().unwrap_err();
        assert!(matches!(
            err,
            SagaError::InvalidOrderStatus {
                status: OrderStatus::Pending,
                action: "pay",
                ..
            }
        ));
        assert!(order.refund().is_err());

        order.confirm().unwrap();
        order.mark_paid().unwrap();
        order.ship().unwrap();
        assert!(order.cancel("too late").is_err());
        order.refund().unwrap();
        assert_eq!(order.status, OrderStatus::Refunded);
    }

    #[test]
    fn cancel_records_reason() {
        let mut order = order(vec![item(1, 100, 1)]);
        order.cancel("changed my mind").unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(order.cancel_reason.as_deref(), Some("changed my mind"));
        assert!(order.cancelled_at.is_some());
        assert!(order.cancel("again").is_err());
    }

    #[test]
    fn discount_is_capped_at_total() {
        let mut order = order(vec![item(1, 1000, 1)]);
        order.apply_discount(Money::from_cents(300)).unwrap();
        assert_eq!(order.final_amount, Money::from_cents(700));

        order.apply_discount(Money::from_cents(5000)).unwrap();
        assert_eq!(order.discount, Money::from_cents(1000));
        assert_eq!(order.final_amount, Money::zero());

        assert!(order.apply_discount(Money::from_cents(-1)).is_err());

        order.clear_discount().unwrap();
        assert_eq!(order.discount, Money::zero());
        assert_eq!(order.final_amount, order.total_amount);
    }

    #[test]
    fn rejects_amounts_that_overflow() {
        let actor = ActorId::new("buyer");
        let price = i64::MAX / 2 + 1;
        assert!(matches!(
            Order::new(actor.clone(), ShippingInfo::default(), vec![item(1, price, 2)]),
            Err(SagaError::InvalidItem(_))
        ));
        assert!(matches!(
            Order::new(
                actor.clone(),
                ShippingInfo::default(),
                vec![item(1, price, 1), item(2, price, 1)]
            ),
            Err(SagaError::InvalidItem(_))
        ));
        assert!(matches!(
            Order::new(
                actor,
                ShippingInfo::default(),
                vec![item(1, 1, u32::MAX), item(1, 1, 1)]
            ),
            Err(SagaError::InvalidItem(_))
        ));
    }
}
