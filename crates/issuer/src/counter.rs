//! Atomic check-and-decrement counters.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{ActorId, ProductId};
use tokio::sync::Mutex;

use crate::error::{IssuerError, Result};

/// Result of one atomic issuance attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueOutcome {
    /// Units were taken. Carries the issued/sold count after this attempt.
    Granted(i64),
    /// The actor already holds the per-actor maximum.
    AlreadyIssued,
    /// Not enough remaining capacity.
    Exhausted,
}

impl IssueOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueOutcome::Granted(_) => "granted",
            IssueOutcome::AlreadyIssued => "already_issued",
            IssueOutcome::Exhausted => "exhausted",
        }
    }

    /// Decodes the reply of the issuance script: `-1`, `0` or the new count.
    pub(crate) fn from_reply(reply: i64) -> Result<Self> {
        match reply {
            -1 => Ok(IssueOutcome::AlreadyIssued),
            0 => Ok(IssueOutcome::Exhausted),
            n if n > 0 => Ok(IssueOutcome::Granted(n)),
            other => Err(IssuerError::UnexpectedReply(other)),
        }
    }
}

/// Keys of one limited resource in the counter store.
///
/// `stock` holds the remaining capacity; `holders` maps each actor to the
/// quantity it holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKeys {
    pub stock: String,
    pub holders: String,
}

impl CounterKeys {
    pub fn coupon(coupon_id: i64) -> Self {
        Self {
            stock: format!("coupon:stock:{coupon_id}"),
            holders: format!("coupon:issued:{coupon_id}"),
        }
    }

    pub fn time_deal(deal_id: i64, product_id: ProductId) -> Self {
        Self {
            stock: format!("timedeal:stock:{deal_id}:{product_id}"),
            holders: format!("timedeal:purchased:{deal_id}:{product_id}"),
        }
    }
}

/// One issuance attempt.
#[derive(Debug, Clone)]
pub struct IssueRequest {
    pub actor: ActorId,
    pub quantity: i64,
    /// Maximum total quantity a single actor may hold. `1` for coupons.
    pub per_actor_limit: i64,
    /// Total capacity, used to turn remaining stock into an issued count.
    pub capacity: i64,
}

/// Store that executes issuance as one indivisible step.
///
/// Implementations must not read-then-write from the client: the
/// per-actor check, the capacity check and both writes happen in a
/// single server-side step, so concurrent callers never block on each
/// other and never over-allocate.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Sets the remaining capacity of a resource.
    async fn seed(&self, keys: &CounterKeys, remaining: i64) -> Result<()>;

    /// Attempts to take `request.quantity` units for `request.actor`.
    async fn try_issue(&self, keys: &CounterKeys, request: &IssueRequest) -> Result<IssueOutcome>;

    /// Gives units back to the pool and to the actor's allowance.
    async fn restore(&self, keys: &CounterKeys, actor: &ActorId, quantity: i64) -> Result<()>;

    /// Returns the remaining capacity, or `None` if the resource was never seeded.
    async fn remaining(&self, keys: &CounterKeys) -> Result<Option<i64>>;

    /// Removes the resource's keys.
    async fn clear(&self, keys: &CounterKeys) -> Result<()>;
}

#[async_trait]
impl<T: CounterStore + ?Sized> CounterStore for Arc<T> {
    async fn seed(&self, keys: &CounterKeys, remaining: i64) -> Result<()> {
        (**self).seed(keys, remaining).await
    }

    async fn try_issue(&self, keys: &CounterKeys, request: &IssueRequest) -> Result<IssueOutcome> {
        (**self).try_issue(keys, request).await
    }

    async fn restore(&self, keys: &CounterKeys, actor: &ActorId, quantity: i64) -> Result<()> {
        (**self).restore(keys, actor, quantity).await
    }

    async fn remaining(&self, keys: &CounterKeys) -> Result<Option<i64>> {
        (**self).remaining(keys).await
    }

    async fn clear(&self, keys: &CounterKeys) -> Result<()> {
        (**self).clear(keys).await
    }
}

#[derive(Debug, Default)]
struct Counters {
    stock: HashMap<String, i64>,
    holders: HashMap<String, HashMap<ActorId, i64>>,
}

/// Counter store for a single process.
///
/// One mutex guards all counters, so each call runs alone, like a
/// script on a single-threaded server.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCounterStore {
    inner: Arc<Mutex<Counters>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the quantity an actor holds.
    pub async fn held_by(&self, keys: &CounterKeys, actor: &ActorId) -> i64 {
        let counters = self.inner.lock().await;
        counters
            .holders
            .get(&keys.holders)
            .and_then(|h| h.get(actor))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn seed(&self, keys: &CounterKeys, remaining: i64) -> Result<()> {
        self.inner
            .lock()
            .await
            .stock
            .insert(keys.stock.clone(), remaining);
        Ok(())
    }

    async fn try_issue(&self, keys: &CounterKeys, request: &IssueRequest) -> Result<IssueOutcome> {
        let mut guard = self.inner.lock().await;
        let counters = &mut *guard;

        let holders = counters.holders.entry(keys.holders.clone()).or_default();
        let held = holders.get(&request.actor).copied().unwrap_or(0);
        if held + request.quantity > request.per_actor_limit {
            return Ok(IssueOutcome::AlreadyIssued);
        }

        let remaining = counters.stock.entry(keys.stock.clone()).or_insert(0);
        if *remaining < request.quantity {
            return Ok(IssueOutcome::Exhausted);
        }
        *remaining -= request.quantity;
        let issued = request.capacity - *remaining;
        holders.insert(request.actor.clone(), held + request.quantity);

        IssueOutcome::from_reply(issued)
    }

    async fn restore(&self, keys: &CounterKeys, actor: &ActorId, quantity: i64) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let counters = &mut *guard;

        let holders = counters.holders.entry(keys.holders.clone()).or_default();
        let held = holders.get(actor).copied().unwrap_or(0);
        if held < quantity {
            return Err(IssuerError::NothingToRestore {
                key: keys.holders.clone(),
                actor: actor.to_string(),
            });
        }
        if held == quantity {
            holders.remove(actor);
        } else {
            holders.insert(actor.clone(), held - quantity);
        }
        *counters.stock.entry(keys.stock.clone()).or_insert(0) += quantity;
        Ok(())
    }

    async fn remaining(&self, keys: &CounterKeys) -> Result<Option<i64>> {
        Ok(self.inner.lock().await.stock.get(&keys.stock).copied())
    }

    async fn clear(&self, keys: &CounterKeys) -> Result<()> {
        let mut counters = self.inner.lock().await;
        counters.stock.remove(&keys.stock);
        counters.holders.remove(&keys.holders);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(actor: &str, quantity: i64, limit: i64, capacity: i64) -> IssueRequest {
        IssueRequest {
            actor: ActorId::new(actor),
            quantity,
            per_actor_limit: limit,
            capacity,
        }
    }

    #[test]
    fn reply_decoding() {
        assert_eq!(
            IssueOutcome::from_reply(-1).unwrap(),
            IssueOutcome::AlreadyIssued
        );
        assert_eq!(IssueOutcome::from_reply(0).unwrap(), IssueOutcome::Exhausted);
        assert_eq!(
            IssueOutcome::from_reply(3).unwrap(),
            IssueOutcome::Granted(3)
        );
        assert!(IssueOutcome::from_reply(-2).is_err());
    }

    #[tokio::test]
    async fn test_second_issue_to_same_actor_is_already_issued() {
        let store = InMemoryCounterStore::new();
        let keys = CounterKeys::coupon(1);
        store.seed(&keys, 10).await.unwrap();

        let first = store.try_issue(&keys, &request("a", 1, 1, 10)).await.unwrap();
        let second = store.try_issue(&keys, &request("a", 1, 1, 10)).await.unwrap();

        assert_eq!(first, IssueOutcome::Granted(1));
        assert_eq!(second, IssueOutcome::AlreadyIssued);
        assert_eq!(store.remaining(&keys).await.unwrap(), Some(9));
    }

    #[tokio::test]
    async fn test_unseeded_resource_is_exhausted() {
        let store = InMemoryCounterStore::new();
        let keys = CounterKeys::coupon(2);
        let outcome = store.try_issue(&keys, &request("a", 1, 1, 10)).await.unwrap();
        assert_eq!(outcome, IssueOutcome::Exhausted);
        assert_eq!(store.held_by(&keys, &ActorId::new("a")).await, 0);
    }

    #[tokio::test]
    async fn test_per_actor_limit_counts_quantity() {
        let store = InMemoryCounterStore::new();
        let keys = CounterKeys::time_deal(1, ProductId::new(5));
        store.seed(&keys, 100).await.unwrap();

        assert_eq!(
            store.try_issue(&keys, &request("a", 2, 3, 100)).await.unwrap(),
            IssueOutcome::Granted(2)
        );
        assert_eq!(
            store.try_issue(&keys, &request("a", 2, 3, 100)).await.unwrap(),
            IssueOutcome::AlreadyIssued
        );
        assert_eq!(
            store.try_issue(&keys, &request("a", 1, 3, 100)).await.unwrap(),
            IssueOutcome::Granted(3)
        );
    }

    #[tokio::test]
    async fn test_restore_returns_units_and_allowance() {
        let store = InMemoryCounterStore::new();
        let keys = CounterKeys::time_deal(1, ProductId::new(5));
        let actor = ActorId::new("a");
        store.seed(&keys, 2).await.unwrap();
        store.try_issue(&keys, &request("a", 2, 2, 2)).await.unwrap();

        store.restore(&keys, &actor, 2).await.unwrap();
        assert_eq!(store.remaining(&keys).await.unwrap(), Some(2));
        assert_eq!(store.held_by(&keys, &actor).await, 0);
        assert!(store.restore(&keys, &actor, 1).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_last_unit_goes_to_exactly_one_caller() {
        let store = InMemoryCounterStore::new();
        let keys = CounterKeys::coupon(3);
        store.seed(&keys, 1).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..64 {
            let store = store.clone();
            let keys = keys.clone();
            handles.push(tokio::spawn(async move {
                store
                    .try_issue(&keys, &request(&format!("actor-{i}"), 1, 1, 100))
                    .await
                    .unwrap()
            }));
        }

        let mut granted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                IssueOutcome::Granted(count) => {
                    granted += 1;
                    assert_eq!(count, 100);
                }
                IssueOutcome::Exhausted => {}
                IssueOutcome::AlreadyIssued => panic!("distinct actors"),
            }
        }
        assert_eq!(granted, 1);
    }
}
