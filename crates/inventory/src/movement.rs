//! Append-only stock movement audit log.

use chrono::{DateTime, Utc};
use common::{ActorId, ProductId};
use serde::{Deserialize, Serialize};

use crate::record::InventoryRecord;

/// The kind of change a movement records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementKind {
    Initial,
    Reserve,
    Deduct,
    Release,
    Inbound,
    Return,
    Adjustment,
}

impl MovementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementKind::Initial => "INITIAL",
            MovementKind::Reserve => "RESERVE",
            MovementKind::Deduct => "DEDUCT",
            MovementKind::Release => "RELEASE",
            MovementKind::Inbound => "INBOUND",
            MovementKind::Return => "RETURN",
            MovementKind::Adjustment => "ADJUSTMENT",
        }
    }
}

impl std::str::FromStr for MovementKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "INITIAL" => Ok(MovementKind::Initial),
            "RESERVE" => Ok(MovementKind::Reserve),
            "DEDUCT" => Ok(MovementKind::Deduct),
            "RELEASE" => Ok(MovementKind::Release),
            "INBOUND" => Ok(MovementKind::Inbound),
            "RETURN" => Ok(MovementKind::Return),
            "ADJUSTMENT" => Ok(MovementKind::Adjustment),
            other => Err(format!("unknown movement kind: {other}")),
        }
    }
}

/// What caused a movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReferenceType {
    Order,
    OrderCancel,
    Admin,
    System,
}

impl ReferenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceType::Order => "ORDER",
            ReferenceType::OrderCancel => "ORDER_CANCEL",
            ReferenceType::Admin => "ADMIN",
            ReferenceType::System => "SYSTEM",
        }
    }
}

impl std::str::FromStr for ReferenceType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ORDER" => Ok(ReferenceType::Order),
            "ORDER_CANCEL" => Ok(ReferenceType::OrderCancel),
            "ADMIN" => Ok(ReferenceType::Admin),
            "SYSTEM" => Ok(ReferenceType::System),
            other => Err(format!("unknown reference type: {other}")),
        }
    }
}

/// Who and what a ledger call is on behalf of, copied into each movement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovementContext {
    pub reference_type: ReferenceType,
    pub reference_id: Option<String>,
    pub reason: Option<String>,
    pub actor: ActorId,
}

impl MovementContext {
    /// A movement caused by an order (reservation, deduction).
    pub fn order(order_number: impl Into<String>, actor: ActorId) -> Self {
        Self {
            reference_type: ReferenceType::Order,
            reference_id: Some(order_number.into()),
            reason: None,
            actor,
        }
    }

    /// A movement caused by cancelling or compensating an order.
    pub fn order_cancel(order_number: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            reference_type: ReferenceType::OrderCancel,
            reference_id: Some(order_number.into()),
            reason: Some(reason.into()),
            actor: ActorId::system(),
        }
    }

    /// An admin action such as restock or correction.
    pub fn admin(actor: ActorId, reason: impl Into<String>) -> Self {
        Self {
            reference_type: ReferenceType::Admin,
            reference_id: None,
            reason: Some(reason.into()),
            actor,
        }
    }

    pub fn system(reason: impl Into<String>) -> Self {
        Self {
            reference_type: ReferenceType::System,
            reference_id: None,
            reason: Some(reason.into()),
            actor: ActorId::system(),
        }
    }
}

/// One immutable audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    /// Sequence number assigned by the log, increasing.
    pub id: i64,
    pub product_id: ProductId,
    pub kind: MovementKind,
    pub quantity: i64,
    pub previous_available: i64,
    pub after_available: i64,
    pub previous_reserved: i64,
    pub after_reserved: i64,
    pub reference_type: ReferenceType,
    pub reference_id: Option<String>,
    pub reason: Option<String>,
    pub performed_by: ActorId,
    pub created_at: DateTime<Utc>,
}

impl StockMovement {
    /// Builds an unsaved movement (id 0) from before/after snapshots.
    pub(crate) fn between(
        before: &InventoryRecord,
        after: &InventoryRecord,
        kind: MovementKind,
        quantity: i64,
        ctx: &MovementContext,
    ) -> Self {
        Self {
            id: 0,
            product_id: after.product_id,
            kind,
            quantity,
            previous_available: before.available,
            after_available: after.available,
            previous_reserved: before.reserved,
            after_reserved: after.reserved,
            reference_type: ctx.reference_type,
            reference_id: ctx.reference_id.clone(),
            reason: ctx.reason.clone(),
            performed_by: ctx.actor.clone(),
            created_at: after.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_parse_back_from_storage_names() {
        for kind in [
            MovementKind::Initial,
            MovementKind::Reserve,
            MovementKind::Deduct,
            MovementKind::Release,
            MovementKind::Inbound,
            MovementKind::Return,
            MovementKind::Adjustment,
        ] {
            assert_eq!(kind.as_str().parse::<MovementKind>().unwrap(), kind);
        }
        assert!("SHRINK".parse::<MovementKind>().is_err());
    }

    #[test]
    fn cancel_context_is_performed_by_system() {
        let ctx = MovementContext::order_cancel("ORD-1", "payment failed");
        assert_eq!(ctx.reference_type, ReferenceType::OrderCancel);
        assert_eq!(ctx.actor, ActorId::system());
    }
}
