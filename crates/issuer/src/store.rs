//! Durable issuance records.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{ActorId, ProductId};
use tokio::sync::RwLock;

use crate::coupon::{Coupon, CouponGrant, GrantStatus, NewCoupon};
use crate::error::{IssuerError, Result};
use crate::timedeal::{NewTimeDeal, TimeDeal, TimeDealPurchase};

#[derive(Debug, Default)]
struct Tables {
    next_id: i64,
    coupons: HashMap<i64, Coupon>,
    grants: HashMap<i64, CouponGrant>,
    /// Unique (coupon, actor) pairs.
    grant_owners: HashSet<(i64, ActorId)>,
    deals: HashMap<i64, TimeDeal>,
    purchases: HashMap<i64, TimeDealPurchase>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// System of record for coupons, grants, time deals and purchases.
///
/// Consulted after the counter store has admitted an issuance; writes
/// that belong together (grant + issued mirror, purchase + sold mirror)
/// happen under one lock.
#[derive(Debug, Clone, Default)]
pub struct IssuanceStore {
    tables: Arc<RwLock<Tables>>,
}

impl IssuanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_coupon(&self, new: NewCoupon) -> Result<Coupon> {
        let mut tables = self.tables.write().await;
        let id = tables.next_id();
        let coupon = Coupon::create(id, new)?;
        tables.coupons.insert(id, coupon.clone());
        Ok(coupon)
    }

    pub async fn coupon(&self, coupon_id: i64) -> Result<Coupon> {
        self.tables
            .read()
            .await
            .coupons
            .get(&coupon_id)
            .cloned()
            .ok_or(IssuerError::CouponNotFound(coupon_id))
    }

    pub async fn update_coupon<F>(&self, coupon_id: i64, f: F) -> Result<Coupon>
    where
        F: FnOnce(&mut Coupon) -> Result<()>,
    {
        let mut tables = self.tables.write().await;
        let coupon = tables
            .coupons
            .get_mut(&coupon_id)
            .ok_or(IssuerError::CouponNotFound(coupon_id))?;
        f(coupon)?;
        Ok(coupon.clone())
    }

    /// Writes the grant and bumps the coupon's issued mirror together.
    pub async fn record_grant(
        &self,
        coupon_id: i64,
        actor: &ActorId,
        issued_count: i64,
        now: DateTime<Utc>,
    ) -> Result<CouponGrant> {
        let mut tables = self.tables.write().await;
        if tables.grant_owners.contains(&(coupon_id, actor.clone())) {
            return Err(IssuerError::AlreadyIssued {
                coupon_id,
                actor: actor.to_string(),
            });
        }
        let id = tables.next_id();
        let coupon = tables
            .coupons
            .get_mut(&coupon_id)
            .ok_or(IssuerError::CouponNotFound(coupon_id))?;
        coupon.record_issue();

        let grant = CouponGrant {
            id,
            coupon_id,
            actor: actor.clone(),
            status: GrantStatus::Issued,
            issued_count,
            issued_at: now,
            expires_at: coupon.expires_at,
            used_at: None,
            order_number: None,
        };
        tables.grant_owners.insert((coupon_id, actor.clone()));
        tables.grants.insert(id, grant.clone());
        Ok(grant)
    }

    pub async fn grant(&self, grant_id: i64) -> Result<CouponGrant> {
        self.tables
            .read()
            .await
            .grants
            .get(&grant_id)
            .cloned()
            .ok_or(IssuerError::GrantNotFound(grant_id))
    }

    /// Applies `f` to a grant and stores the result even when `f` fails,
    /// so status flips made on the way to a rejection are kept.
    pub async fn update_grant<F>(&self, grant_id: i64, f: F) -> Result<CouponGrant>
    where
        F: FnOnce(&mut CouponGrant) -> Result<()>,
    {
        let mut tables = self.tables.write().await;
        let grant = tables
            .grants
            .get_mut(&grant_id)
            .ok_or(IssuerError::GrantNotFound(grant_id))?;
        f(grant)?;
        Ok(grant.clone())
    }

    pub async fn grants_for(&self, actor: &ActorId) -> Vec<CouponGrant> {
        let tables = self.tables.read().await;
        let mut grants: Vec<CouponGrant> = tables
            .grants
            .values()
            .filter(|g| &g.actor == actor)
            .cloned()
            .collect();
        grants.sort_by_key(|g| g.id);
        grants
    }

    pub async fn insert_deal(&self, new: NewTimeDeal) -> Result<TimeDeal> {
        let mut tables = self.tables.write().await;
        let id = tables.next_id();
        let deal = TimeDeal::create(id, new)?;
        tables.deals.insert(id, deal.clone());
        Ok(deal)
    }

    pub async fn deal(&self, deal_id: i64) -> Result<TimeDeal> {
        self.tables
            .read()
            .await
            .deals
            .get(&deal_id)
            .cloned()
            .ok_or(IssuerError::TimeDealNotFound(deal_id))
    }

    pub async fn update_deal<F>(&self, deal_id: i64, f: F) -> Result<TimeDeal>
    where
        F: FnOnce(&mut TimeDeal) -> Result<()>,
    {
        let mut tables = self.tables.write().await;
        let deal = tables
            .deals
            .get_mut(&deal_id)
            .ok_or(IssuerError::TimeDealNotFound(deal_id))?;
        f(deal)?;
        Ok(deal.clone())
    }

    /// Writes the purchase and bumps the product's sold mirror together.
    pub async fn record_purchase(
        &self,
        deal_id: i64,
        product_id: ProductId,
        actor: &ActorId,
        quantity: i64,
        sold_count: i64,
        now: DateTime<Utc>,
    ) -> Result<TimeDealPurchase> {
        let mut tables = self.tables.write().await;
        let id = tables.next_id();
        let deal = tables
            .deals
            .get_mut(&deal_id)
            .ok_or(IssuerError::TimeDealNotFound(deal_id))?;
        let product = deal.product_mut(product_id)?;
        let total_price = product
            .deal_price
            .checked_multiply(quantity)
            .ok_or(IssuerError::InvalidQuantity(quantity))?;
        product.sold_quantity += quantity;

        let purchase = TimeDealPurchase {
            id,
            deal_id,
            product_id,
            actor: actor.clone(),
            quantity,
            deal_price: product.deal_price,
            total_price,
            sold_count,
            purchased_at: now,
            rolled_back_at: None,
        };
        tables.purchases.insert(id, purchase.clone());
        Ok(purchase)
    }

    pub async fn purchase(&self, purchase_id: i64) -> Result<TimeDealPurchase> {
        self.tables
            .read()
            .await
            .purchases
            .get(&purchase_id)
            .cloned()
            .ok_or(IssuerError::PurchaseNotFound(purchase_id))
    }

    /// Marks a purchase rolled back and takes its units off the sold mirror.
    pub async fn record_rollback(
        &self,
        purchase_id: i64,
        now: DateTime<Utc>,
    ) -> Result<TimeDealPurchase> {
        let mut tables = self.tables.write().await;
        let purchase = tables
            .purchases
            .get_mut(&purchase_id)
            .ok_or(IssuerError::PurchaseNotFound(purchase_id))?;
        purchase.rolled_back_at = Some(now);
        let purchase = purchase.clone();

        let deal = tables
            .deals
            .get_mut(&purchase.deal_id)
            .ok_or(IssuerError::TimeDealNotFound(purchase.deal_id))?;
        let product = deal.product_mut(purchase.product_id)?;
        product.sold_quantity -= purchase.quantity;
        Ok(purchase)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use common::Money;

    use super::*;
    use crate::coupon::DiscountType;

    fn new_coupon() -> NewCoupon {
        let now = Utc::now();
        NewCoupon {
            code: "C".to_string(),
            name: "C".to_string(),
            discount_type: DiscountType::Fixed,
            discount_value: 500,
            minimum_order: Money::zero(),
            maximum_discount: None,
            capacity: 5,
            starts_at: now - Duration::hours(1),
            expires_at: now + Duration::hours(1),
        }
    }

    #[tokio::test]
    async fn test_grant_is_unique_per_actor() {
        let store = IssuanceStore::new();
        let coupon = store.insert_coupon(new_coupon()).await.unwrap();
        let actor = ActorId::new("a");

        store
            .record_grant(coupon.id, &actor, 1, Utc::now())
            .await
            .unwrap();
        let err = store
            .record_grant(coupon.id, &actor, 2, Utc::now())
            .await
            .unwrap_err();

        assert!(matches!(err, IssuerError::AlreadyIssued { .. }));
        assert_eq!(store.coupon(coupon.id).await.unwrap().issued, 1);
        assert_eq!(store.grants_for(&actor).await.len(), 1);
    }

    #[tokio::test]
    async fn test_grant_copies_coupon_expiry() {
        let store = IssuanceStore::new();
        let coupon = store.insert_coupon(new_coupon()).await.unwrap();
        let grant = store
            .record_grant(coupon.id, &ActorId::new("a"), 1, Utc::now())
            .await
            .unwrap();
        assert_eq!(grant.expires_at, coupon.expires_at);
        assert_eq!(grant.status, GrantStatus::Issued);
    }
}
