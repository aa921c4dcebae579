//! Coupon and coupon grant records.

use chrono::{DateTime, Utc};
use common::{ActorId, Money};
use serde::{Deserialize, Serialize};

use crate::error::{IssuerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscountType {
    /// `discount_value` is an amount in cents.
    Fixed,
    /// `discount_value` is a percentage between 1 and 100.
    Percentage,
}

/// Coupon lifecycle.
///
/// ```text
/// Active ──┬──► Exhausted   (issued == capacity)
///          ├──► Expired
///          └──► Inactive    (deactivated by an admin)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CouponStatus {
    #[default]
    Active,
    Inactive,
    Exhausted,
    Expired,
}

/// Parameters for creating a coupon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCoupon {
    pub code: String,
    pub name: String,
    pub discount_type: DiscountType,
    pub discount_value: i64,
    pub minimum_order: Money,
    pub maximum_discount: Option<Money>,
    pub capacity: i64,
    pub starts_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A limited-quantity coupon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coupon {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub discount_type: DiscountType,
    pub discount_value: i64,
    pub minimum_order: Money,
    pub maximum_discount: Option<Money>,
    pub capacity: i64,
    /// Durable mirror of the counter store's issued count.
    pub issued: i64,
    pub status: CouponStatus,
    pub starts_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Coupon {
    pub(crate) fn create(id: i64, new: NewCoupon) -> Result<Self> {
        if new.capacity <= 0 {
            return Err(IssuerError::InvalidQuantity(new.capacity));
        }
        if new.starts_at >= new.expires_at {
            return Err(IssuerError::InvalidPeriod);
        }
        match new.discount_type {
            DiscountType::Percentage if !(1..=100).contains(&new.discount_value) => {
                return Err(IssuerError::InvalidDiscount(format!(
                    "percentage must be between 1 and 100, got {}",
                    new.discount_value
                )));
            }
            DiscountType::Fixed if new.discount_value <= 0 => {
                return Err(IssuerError::InvalidDiscount(format!(
                    "fixed discount must be positive, got {}",
                    new.discount_value
                )));
            }
            _ => {}
        }

        Ok(Self {
            id,
            code: new.code,
            name: new.name,
            discount_type: new.discount_type,
            discount_value: new.discount_value,
            minimum_order: new.minimum_order,
            maximum_discount: new.maximum_discount,
            capacity: new.capacity,
            issued: 0,
            status: CouponStatus::Active,
            starts_at: new.starts_at,
            expires_at: new.expires_at,
            created_at: Utc::now(),
        })
    }

    /// Local checks done before touching the shared counter, in the order
    /// inactive, not started, expired, exhausted.
    pub fn check_issuable(&self, now: DateTime<Utc>) -> Result<()> {
        let id = self.id;
        if self.status == CouponStatus::Inactive {
            return Err(IssuerError::NotActive {
                resource: "Coupon",
                id,
            });
        }
        if now < self.starts_at {
            return Err(IssuerError::NotStarted {
                resource: "Coupon",
                id,
            });
        }
        if self.status == CouponStatus::Expired || now > self.expires_at {
            return Err(IssuerError::Expired {
                resource: "Coupon",
                id,
            });
        }
        if self.status == CouponStatus::Exhausted || self.issued >= self.capacity {
            return Err(IssuerError::Exhausted {
                resource: "Coupon",
                id,
            });
        }
        Ok(())
    }

    pub(crate) fn record_issue(&mut self) {
        self.issued += 1;
        if self.issued >= self.capacity {
            self.status = CouponStatus::Exhausted;
        }
    }

    /// Discount this coupon gives on an order of `order_amount`.
    ///
    /// Zero below the minimum order amount; never more than the order.
    pub fn calculate_discount(&self, order_amount: Money) -> Money {
        if order_amount < self.minimum_order {
            return Money::zero();
        }
        let discount = match self.discount_type {
            DiscountType::Fixed => Money::from_cents(self.discount_value),
            DiscountType::Percentage => {
                let raw = order_amount.percent(self.discount_value);
                match self.maximum_discount {
                    Some(cap) if raw > cap => cap,
                    _ => raw,
                }
            }
        };
        discount.min(order_amount)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GrantStatus {
    #[default]
    Issued,
    Used,
    Expired,
}

/// One actor's copy of a coupon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouponGrant {
    pub id: i64,
    pub coupon_id: i64,
    pub actor: ActorId,
    pub status: GrantStatus,
    /// The coupon's issued count right after this grant.
    pub issued_count: i64,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub order_number: Option<String>,
}

impl CouponGrant {
    /// Marks the grant used for an order.
    ///
    /// A grant past its expiry is flipped to `Expired` and rejected.
    pub(crate) fn redeem(&mut self, order_number: &str, now: DateTime<Utc>) -> Result<()> {
        match self.status {
            GrantStatus::Used => return Err(IssuerError::GrantAlreadyUsed(self.id)),
            GrantStatus::Expired => return Err(IssuerError::GrantExpired(self.id)),
            GrantStatus::Issued => {}
        }
        if now > self.expires_at {
            self.status = GrantStatus::Expired;
            return Err(IssuerError::GrantExpired(self.id));
        }
        self.status = GrantStatus::Used;
        self.used_at = Some(now);
        self.order_number = Some(order_number.to_string());
        Ok(())
    }

    /// Hands a grant redeemed against `order_number` back to its owner.
    pub(crate) fn restore(&mut self, order_number: &str) -> Result<()> {
        if self.status != GrantStatus::Used || self.order_number.as_deref() != Some(order_number) {
            return Err(IssuerError::GrantNotHeld {
                grant_id: self.id,
                order_number: order_number.to_string(),
            });
        }
        self.status = GrantStatus::Issued;
        self.used_at = None;
        self.order_number = None;
        Ok(())
    }
}
