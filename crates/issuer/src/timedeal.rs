//! Time-deal (flash sale) records.

use chrono::{DateTime, Utc};
use common::{ActorId, Money, ProductId};
use serde::{Deserialize, Serialize};

use crate::error::{IssuerError, Result};

/// Time deal lifecycle.
///
/// ```text
/// Scheduled ──► Active ──► Ended
///     │            │
///     └────────────┴──► Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeDealStatus {
    #[default]
    Scheduled,
    Active,
    Ended,
    Cancelled,
}

impl TimeDealStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeDealStatus::Scheduled => "SCHEDULED",
            TimeDealStatus::Active => "ACTIVE",
            TimeDealStatus::Ended => "ENDED",
            TimeDealStatus::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTimeDealProduct {
    pub product_id: ProductId,
    pub deal_price: Money,
    pub deal_quantity: i64,
    pub max_per_user: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTimeDeal {
    pub name: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub products: Vec<NewTimeDealProduct>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeDealProduct {
    pub product_id: ProductId,
    pub deal_price: Money,
    pub deal_quantity: i64,
    /// Durable mirror of the counter store's sold count.
    pub sold_quantity: i64,
    pub max_per_user: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeDeal {
    pub id: i64,
    pub name: String,
    pub status: TimeDealStatus,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub products: Vec<TimeDealProduct>,
    pub created_at: DateTime<Utc>,
}

impl TimeDeal {
    pub(crate) fn create(id: i64, new: NewTimeDeal) -> Result<Self> {
        if new.starts_at >= new.ends_at {
            return Err(IssuerError::InvalidPeriod);
        }
        if new.products.is_empty() {
            return Err(IssuerError::InvalidQuantity(0));
        }
        let mut products = Vec::with_capacity(new.products.len());
        for p in new.products {
            if p.deal_quantity <= 0 {
                return Err(IssuerError::InvalidQuantity(p.deal_quantity));
            }
            if p.max_per_user <= 0 {
                return Err(IssuerError::InvalidQuantity(p.max_per_user));
            }
            products.push(TimeDealProduct {
                product_id: p.product_id,
                deal_price: p.deal_price,
                deal_quantity: p.deal_quantity,
                sold_quantity: 0,
                max_per_user: p.max_per_user,
            });
        }

        Ok(Self {
            id,
            name: new.name,
            status: TimeDealStatus::Scheduled,
            starts_at: new.starts_at,
            ends_at: new.ends_at,
            products,
            created_at: Utc::now(),
        })
    }

    /// Local checks done before touching the shared counter.
    pub fn check_purchasable(&self, now: DateTime<Utc>) -> Result<()> {
        let id = self.id;
        if self.status != TimeDealStatus::Active {
            return Err(IssuerError::NotActive {
                resource: "Time deal",
                id,
            });
        }
        if now < self.starts_at {
            return Err(IssuerError::NotStarted {
                resource: "Time deal",
                id,
            });
        }
        if now > self.ends_at {
            return Err(IssuerError::Expired {
                resource: "Time deal",
                id,
            });
        }
        Ok(())
    }

    pub fn product(&self, product_id: ProductId) -> Result<&TimeDealProduct> {
        self.products
            .iter()
            .find(|p| p.product_id == product_id)
            .ok_or(IssuerError::TimeDealProductNotFound {
                deal_id: self.id,
                product_id,
            })
    }

    pub(crate) fn product_mut(&mut self, product_id: ProductId) -> Result<&mut TimeDealProduct> {
        let deal_id = self.id;
        self.products
            .iter_mut()
            .find(|p| p.product_id == product_id)
            .ok_or(IssuerError::TimeDealProductNotFound {
                deal_id,
                product_id,
            })
    }

    pub(crate) fn start(&mut self) -> Result<()> {
        if self.status != TimeDealStatus::Scheduled {
            return Err(self.invalid_status());
        }
        self.status = TimeDealStatus::Active;
        Ok(())
    }

    pub(crate) fn cancel(&mut self) -> Result<()> {
        if !matches!(
            self.status,
            TimeDealStatus::Scheduled | TimeDealStatus::Active
        ) {
            return Err(self.invalid_status());
        }
        self.status = TimeDealStatus::Cancelled;
        Ok(())
    }

    pub(crate) fn end(&mut self) -> Result<()> {
        if self.status != TimeDealStatus::Active {
            return Err(self.invalid_status());
        }
        self.status = TimeDealStatus::Ended;
        Ok(())
    }

    fn invalid_status(&self) -> IssuerError {
        IssuerError::InvalidTimeDealStatus {
            id: self.id,
            status: self.status.as_str(),
        }
    }
}

/// One actor's purchase of time-deal units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeDealPurchase {
    pub id: i64,
    pub deal_id: i64,
    pub product_id: ProductId,
    pub actor: ActorId,
    pub quantity: i64,
    pub deal_price: Money,
    pub total_price: Money,
    /// Product's sold count right after this purchase.
    pub sold_count: i64,
    pub purchased_at: DateTime<Utc>,
    pub rolled_back_at: Option<DateTime<Utc>>,
}
