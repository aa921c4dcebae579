//! Coupon issuance and redemption.

use std::sync::Arc;

use chrono::Utc;
use common::events::CouponIssuedData;
use common::{ActorId, DomainEvent, EventPublisher, Money};

use crate::counter::{CounterKeys, CounterStore, IssueOutcome, IssueRequest};
use crate::coupon::{Coupon, CouponGrant, CouponStatus, GrantStatus, NewCoupon};
use crate::error::{IssuerError, Result};
use crate::store::IssuanceStore;

/// Issues coupons to actors, at most one per actor, never more than the
/// coupon's capacity.
pub struct CouponIssuer<C: CounterStore> {
    store: IssuanceStore,
    counters: C,
    events: Arc<dyn EventPublisher>,
}

impl<C: CounterStore> CouponIssuer<C> {
    pub fn new(store: IssuanceStore, counters: C, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            store,
            counters,
            events,
        }
    }

    /// Creates a coupon and seeds its counter with the full capacity.
    #[tracing::instrument(skip(self, new), fields(code = %new.code))]
    pub async fn create_coupon(&self, new: NewCoupon) -> Result<Coupon> {
        let coupon = self.store.insert_coupon(new).await?;
        self.counters
            .seed(&CounterKeys::coupon(coupon.id), coupon.capacity)
            .await?;
        tracing::info!(coupon_id = coupon.id, capacity = coupon.capacity, "coupon created");
        Ok(coupon)
    }

    pub async fn get_coupon(&self, coupon_id: i64) -> Result<Coupon> {
        self.store.coupon(coupon_id).await
    }

    /// Issues one copy of a coupon to `actor`.
    ///
    /// The counter store decides the outcome; the durable grant is only
    /// written after a unit was taken, and the unit is given back if that
    /// write fails.
    #[tracing::instrument(skip(self))]
    pub async fn issue(&self, coupon_id: i64, actor: &ActorId) -> Result<CouponGrant> {
        let now = Utc::now();
        let coupon = self.store.coupon(coupon_id).await?;
        if let Err(e) = coupon.check_issuable(now) {
            record_attempt(rejection_label(&e));
            return Err(e);
        }

        let keys = CounterKeys::coupon(coupon_id);
        let request = IssueRequest {
            actor: actor.clone(),
            quantity: 1,
            per_actor_limit: 1,
            capacity: coupon.capacity,
        };
        let outcome = self.counters.try_issue(&keys, &request).await?;
        record_attempt(outcome.as_str());

        let issued_count = match outcome {
            IssueOutcome::Granted(count) => count,
            IssueOutcome::AlreadyIssued => {
                return Err(IssuerError::AlreadyIssued {
                    coupon_id,
                    actor: actor.to_string(),
                });
            }
            IssueOutcome::Exhausted => {
                return Err(IssuerError::Exhausted {
                    resource: "Coupon",
                    id: coupon_id,
                });
            }
        };

        let grant = match self
            .store
            .record_grant(coupon_id, actor, issued_count, now)
            .await
        {
            Ok(grant) => grant,
            Err(e) => {
                if let Err(restore_err) = self.counters.restore(&keys, actor, 1).await {
                    tracing::error!(
                        coupon_id,
                        %actor,
                        error = %restore_err,
                        "failed to give back coupon unit after grant write failed"
                    );
                }
                return Err(e);
            }
        };

        tracing::info!(coupon_id, grant_id = grant.id, issued_count, "coupon issued");
        self.events
            .publish(DomainEvent::CouponIssued(CouponIssuedData {
                coupon_id,
                coupon_code: coupon.code,
                grant_id: grant.id,
                actor_id: actor.clone(),
                issued_at: now,
            }))
            .await;
        Ok(grant)
    }

    /// Redeems a grant against an order.
    #[tracing::instrument(skip(self))]
    pub async fn use_grant(
        &self,
        grant_id: i64,
        actor: &ActorId,
        order_number: &str,
    ) -> Result<CouponGrant> {
        let now = Utc::now();
        self.store
            .update_grant(grant_id, |grant| {
                if &grant.actor != actor {
                    return Err(IssuerError::NotOwner {
                        resource: "Coupon grant",
                        id: grant_id,
                        actor: actor.to_string(),
                    });
                }
                grant.redeem(order_number, now)
            })
            .await
    }

    /// Discount an unused, unexpired grant gives on an order of
    /// `order_amount`.
    pub async fn discount_for(
        &self,
        grant_id: i64,
        actor: &ActorId,
        order_amount: Money,
    ) -> Result<Money> {
        let grant = self.store.grant(grant_id).await?;
        if &grant.actor != actor {
            return Err(IssuerError::NotOwner {
                resource: "Coupon grant",
                id: grant_id,
                actor: actor.to_string(),
            });
        }
        match grant.status {
            GrantStatus::Used => return Err(IssuerError::GrantAlreadyUsed(grant_id)),
            GrantStatus::Expired => return Err(IssuerError::GrantExpired(grant_id)),
            GrantStatus::Issued => {}
        }
        if Utc::now() > grant.expires_at {
            return Err(IssuerError::GrantExpired(grant_id));
        }
        let coupon = self.store.coupon(grant.coupon_id).await?;
        Ok(coupon.calculate_discount(order_amount))
    }

    /// Redeems a grant against an order before it is charged and returns
    /// the discount it gives.
    ///
    /// The redemption is the atomic step: of two concurrent claims on one
    /// grant, exactly one succeeds. A claim whose payment fails is handed
    /// back with [`release_grant`](Self::release_grant).
    #[tracing::instrument(skip(self))]
    pub async fn claim_grant(
        &self,
        grant_id: i64,
        actor: &ActorId,
        order_number: &str,
        order_amount: Money,
    ) -> Result<Money> {
        let discount = self.discount_for(grant_id, actor, order_amount).await?;
        self.use_grant(grant_id, actor, order_number).await?;
        tracing::info!(grant_id, %order_number, %discount, "coupon grant claimed");
        Ok(discount)
    }

    /// Returns a grant claimed for `order_number` to its owner.
    #[tracing::instrument(skip(self))]
    pub async fn release_grant(&self, grant_id: i64, order_number: &str) -> Result<CouponGrant> {
        let grant = self
            .store
            .update_grant(grant_id, |grant| grant.restore(order_number))
            .await?;
        tracing::info!(grant_id, %order_number, "coupon grant released");
        Ok(grant)
    }

    pub async fn grants_for(&self, actor: &ActorId) -> Vec<CouponGrant> {
        self.store.grants_for(actor).await
    }

    /// Stops issuing a coupon and drops its counter.
    #[tracing::instrument(skip(self))]
    pub async fn deactivate(&self, coupon_id: i64) -> Result<Coupon> {
        let coupon = self
            .store
            .update_coupon(coupon_id, |coupon| {
                coupon.status = CouponStatus::Inactive;
                Ok(())
            })
            .await?;
        self.counters.clear(&CounterKeys::coupon(coupon_id)).await?;
        tracing::info!(coupon_id, "coupon deactivated");
        Ok(coupon)
    }
}

fn rejection_label(error: &IssuerError) -> &'static str {
    match error {
        IssuerError::NotActive { .. } => "not_active",
        IssuerError::NotStarted { .. } => "not_started",
        IssuerError::Expired { .. } => "expired",
        IssuerError::Exhausted { .. } => "exhausted",
        _ => "rejected",
    }
}

fn record_attempt(outcome: &'static str) {
    metrics::counter!("issuer_attempts_total", "resource" => "coupon", "outcome" => outcome)
        .increment(1);
}
