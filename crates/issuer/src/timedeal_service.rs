//! Time-deal lifecycle and purchases.

use std::sync::Arc;

use chrono::Utc;
use common::events::TimeDealStartedData;
use common::{ActorId, DomainEvent, EventPublisher, ProductId};

use crate::counter::{CounterKeys, CounterStore, IssueOutcome, IssueRequest};
use crate::error::{IssuerError, Result};
use crate::store::IssuanceStore;
use crate::timedeal::{NewTimeDeal, TimeDeal, TimeDealPurchase};

/// Runs time deals: seeds per-product counters on start and sells units
/// through the same atomic counter discipline as coupons.
pub struct TimeDealService<C: CounterStore> {
    store: IssuanceStore,
    counters: C,
    events: Arc<dyn EventPublisher>,
}

impl<C: CounterStore> TimeDealService<C> {
    pub fn new(store: IssuanceStore, counters: C, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            store,
            counters,
            events,
        }
    }

    #[tracing::instrument(skip(self, new), fields(name = %new.name))]
    pub async fn create_deal(&self, new: NewTimeDeal) -> Result<TimeDeal> {
        let deal = self.store.insert_deal(new).await?;
        tracing::info!(deal_id = deal.id, products = deal.products.len(), "time deal created");
        Ok(deal)
    }

    pub async fn get_deal(&self, deal_id: i64) -> Result<TimeDeal> {
        self.store.deal(deal_id).await
    }

    /// Activates a scheduled deal.
    ///
    /// Each product's counter is seeded with what is left of its deal
    /// quantity before the deal becomes visible as active.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self, deal_id: i64) -> Result<TimeDeal> {
        let deal = self.store.deal(deal_id).await?;
        for product in &deal.products {
            self.counters
                .seed(
                    &CounterKeys::time_deal(deal_id, product.product_id),
                    product.deal_quantity - product.sold_quantity,
                )
                .await?;
        }
        let deal = self.store.update_deal(deal_id, |deal| deal.start()).await?;

        tracing::info!(deal_id, "time deal started");
        self.events
            .publish(DomainEvent::TimeDealStarted(TimeDealStartedData {
                deal_id,
                name: deal.name.clone(),
                starts_at: deal.starts_at,
                ends_at: deal.ends_at,
            }))
            .await;
        Ok(deal)
    }

    /// Buys `quantity` units of one deal product for `actor`.
    #[tracing::instrument(skip(self))]
    pub async fn purchase(
        &self,
        deal_id: i64,
        product_id: ProductId,
        actor: &ActorId,
        quantity: i64,
    ) -> Result<TimeDealPurchase> {
        if quantity <= 0 {
            return Err(IssuerError::InvalidQuantity(quantity));
        }
        let now = Utc::now();
        let deal = self.store.deal(deal_id).await?;
        if let Err(e) = deal.check_purchasable(now) {
            record_attempt("rejected");
            return Err(e);
        }
        let product = deal.product(product_id)?;

        let keys = CounterKeys::time_deal(deal_id, product_id);
        let request = IssueRequest {
            actor: actor.clone(),
            quantity,
            per_actor_limit: product.max_per_user,
            capacity: product.deal_quantity,
        };
        let outcome = self.counters.try_issue(&keys, &request).await?;
        record_attempt(outcome.as_str());

        let sold_count = match outcome {
            IssueOutcome::Granted(count) => count,
            IssueOutcome::AlreadyIssued => {
                return Err(IssuerError::PurchaseLimitExceeded {
                    deal_id,
                    product_id,
                    limit: product.max_per_user,
                });
            }
            IssueOutcome::Exhausted => {
                return Err(IssuerError::Exhausted {
                    resource: "Time deal",
                    id: deal_id,
                });
            }
        };

        match self
            .store
            .record_purchase(deal_id, product_id, actor, quantity, sold_count, now)
            .await
        {
            Ok(purchase) => {
                tracing::info!(
                    deal_id,
                    %product_id,
                    purchase_id = purchase.id,
                    sold_count,
                    "time deal units sold"
                );
                Ok(purchase)
            }
            Err(e) => {
                if let Err(restore_err) = self.counters.restore(&keys, actor, quantity).await {
                    tracing::error!(
                        deal_id,
                        %product_id,
                        %actor,
                        error = %restore_err,
                        "failed to give back time deal units after purchase write failed"
                    );
                }
                Err(e)
            }
        }
    }

    /// Gives a purchase's units back to the pool and to the actor's allowance.
    ///
    /// Rolling back an already rolled back purchase is a no-op.
    #[tracing::instrument(skip(self))]
    pub async fn rollback_purchase(&self, purchase_id: i64) -> Result<TimeDealPurchase> {
        let purchase = self.store.purchase(purchase_id).await?;
        if purchase.rolled_back_at.is_some() {
            return Ok(purchase);
        }
        self.counters
            .restore(
                &CounterKeys::time_deal(purchase.deal_id, purchase.product_id),
                &purchase.actor,
                purchase.quantity,
            )
            .await?;
        let purchase = self.store.record_rollback(purchase_id, Utc::now()).await?;
        tracing::info!(
            purchase_id,
            deal_id = purchase.deal_id,
            quantity = purchase.quantity,
            "time deal purchase rolled back"
        );
        Ok(purchase)
    }

    /// Cancels a scheduled or running deal and drops its counters.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, deal_id: i64) -> Result<TimeDeal> {
        let deal = self.store.update_deal(deal_id, |deal| deal.cancel()).await?;
        self.clear_counters(&deal).await?;
        tracing::info!(deal_id, "time deal cancelled");
        Ok(deal)
    }

    /// Ends a running deal and drops its counters.
    #[tracing::instrument(skip(self))]
    pub async fn end(&self, deal_id: i64) -> Result<TimeDeal> {
        let deal = self.store.update_deal(deal_id, |deal| deal.end()).await?;
        self.clear_counters(&deal).await?;
        tracing::info!(deal_id, "time deal ended");
        Ok(deal)
    }

    async fn clear_counters(&self, deal: &TimeDeal) -> Result<()> {
        for product in &deal.products {
            self.counters
                .clear(&CounterKeys::time_deal(deal.id, product.product_id))
                .await?;
        }
        Ok(())
    }
}

fn record_attempt(outcome: &'static str) {
    metrics::counter!("issuer_attempts_total", "resource" => "time_deal", "outcome" => outcome)
        .increment(1);
}
