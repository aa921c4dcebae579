//! The admission controller.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use chrono::{DateTime, Utc};
use common::ActorId;
use tokio::sync::{Mutex, watch};
use uuid::Uuid;

use crate::config::AdmissionConfig;
use crate::error::{AdmissionError, Result};
use crate::queue::{EntryStatus, EntryStatusView, Queue, QueueEntry, QueueKey, QueueSettings};
use crate::stream::SubscriptionHandle;

#[derive(Debug, Default)]
struct State {
    queues: HashMap<QueueKey, Queue>,
    entries: HashMap<String, QueueEntry>,
    /// Latest token per (queue, actor).
    by_actor: HashMap<(QueueKey, ActorId), String>,
}

impl State {
    fn queue(&self, key: &QueueKey) -> Result<&Queue> {
        self.queues.get(key).ok_or_else(|| not_found(key))
    }

    fn entry(&self, token: &str) -> Result<&QueueEntry> {
        self.entries
            .get(token)
            .ok_or_else(|| AdmissionError::EntryNotFound(token.to_string()))
    }

    /// Marks live entries past their validity window as expired.
    fn expire_overdue(&mut self, now: DateTime<Utc>) -> usize {
        let mut expired = 0;
        for entry in self.entries.values_mut() {
            if entry.status.is_live() && now > entry.expires_at {
                entry.close(EntryStatus::Expired, now);
                if let Some(queue) = self.queues.get_mut(&entry.queue) {
                    queue.remove(&entry.token);
                }
                expired += 1;
            }
        }
        expired
    }

    /// Drops entries closed at least `retention` ago, along with the
    /// actor index pointing at them.
    fn prune_closed(&mut self, now: DateTime<Utc>, retention: chrono::Duration) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.closed_at.is_none_or(|closed| closed + retention > now));
        let entries = &self.entries;
        self.by_actor.retain(|_, token| entries.contains_key(token));
        before - self.entries.len()
    }

    fn view(&self, token: &str) -> Result<EntryStatusView> {
        let entry = self.entry(token)?;
        let queue = self.queue(&entry.queue)?;
        let total_waiting = queue.waiting.len() as u64;
        let position = match entry.status {
            EntryStatus::Waiting => queue.position_of(token),
            _ => None,
        };
        Ok(EntryStatusView {
            token: token.to_string(),
            status: entry.status,
            position,
            estimated_wait_secs: position.map(|p| queue.estimated_wait_secs(p)),
            total_waiting,
        })
    }

    fn admit(&mut self, key: &QueueKey, now: DateTime<Utc>, ttl: chrono::Duration) -> Vec<String> {
        let Some(queue) = self.queues.get_mut(key) else {
            return Vec::new();
        };
        if !queue.active {
            return Vec::new();
        }
        queue.last_batch_at = Some(tokio::time::Instant::now());

        let take = queue.free_slots().min(queue.settings.batch_size);
        let mut admitted = Vec::with_capacity(take);
        while admitted.len() < take {
            let Some(token) = queue.waiting.pop_front() else {
                break;
            };
            if let Some(entry) = self.entries.get_mut(&token) {
                entry.status = EntryStatus::Admitted;
                entry.admitted_at = Some(now);
                entry.expires_at = now + ttl;
            }
            queue.admitted.insert(token.clone());
            admitted.push(token);
        }
        admitted
    }
}

fn not_found(key: &QueueKey) -> AdmissionError {
    AdmissionError::QueueNotFound {
        event_type: key.event_type.clone(),
        event_id: key.event_id,
    }
}

fn record_waiting(key: &QueueKey, queue: &Queue) {
    metrics::gauge!("admission_waiting", "queue" => key.to_string()).set(queue.waiting.len() as f64);
}

/// Waiting room in front of the purchase flow.
///
/// Actors [`enter`](Self::enter) a queue and receive a token. Batches of
/// the oldest waiting entries are admitted on a fixed interval, never
/// beyond the queue's capacity. Admitted actors free their slot with
/// [`complete`](Self::complete), or it frees itself when the token's
/// validity window ends.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct AdmissionController {
    state: Arc<Mutex<State>>,
    pub(crate) subscriptions: Arc<Mutex<HashMap<String, SubscriptionHandle>>>,
    pub(crate) next_subscription: Arc<AtomicU64>,
    pub(crate) config: AdmissionConfig,
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new(AdmissionConfig::default())
    }
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            next_subscription: Arc::new(AtomicU64::new(0)),
            config,
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    fn retention(&self) -> chrono::Duration {
        let cap = chrono::Duration::days(1);
        chrono::Duration::from_std(self.config.entry_retention).map_or(cap, |r| r.min(cap))
    }

    /// Entry validity window, capped at a day.
    fn ttl(&self) -> chrono::Duration {
        let cap = chrono::Duration::days(1);
        chrono::Duration::from_std(self.config.entry_ttl).map_or(cap, |ttl| ttl.min(cap))
    }

    /// Creates a queue or re-activates an existing one with new settings.
    #[tracing::instrument(skip(self))]
    pub async fn activate(&self, key: QueueKey, settings: QueueSettings) -> Result<()> {
        settings.validate()?;
        let mut state = self.state.lock().await;
        let queue = state
            .queues
            .entry(key.clone())
            .or_insert_with(|| Queue::new(settings));
        queue.settings = settings;
        queue.active = true;
        tracing::info!(queue = %key, "queue activated");
        Ok(())
    }

    /// Stops admission and expires every waiting entry.
    #[tracing::instrument(skip(self))]
    pub async fn deactivate(&self, key: &QueueKey) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let queue = state.queues.get_mut(key).ok_or_else(|| not_found(key))?;
        queue.active = false;
        let dropped = queue.waiting.len();
        let now = Utc::now();
        for token in queue.waiting.drain(..) {
            if let Some(entry) = state.entries.get_mut(&token) {
                entry.close(EntryStatus::Expired, now);
            }
        }
        record_waiting(key, queue);
        tracing::info!(queue = %key, expired = dropped, "queue deactivated");
        Ok(())
    }

    /// Puts `actor` in line. An actor already waiting or admitted gets its
    /// existing token back.
    #[tracing::instrument(skip(self))]
    pub async fn enter(&self, key: &QueueKey, actor: &ActorId) -> Result<EntryStatusView> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.expire_overdue(now);

        let queue = state.queue(key)?;
        if !queue.active {
            return Err(AdmissionError::QueueInactive {
                event_type: key.event_type.clone(),
                event_id: key.event_id,
            });
        }

        let actor_key = (key.clone(), actor.clone());
        if let Some(token) = state.by_actor.get(&actor_key) {
            if state.entry(token)?.status.is_live() {
                return state.view(&token.clone());
            }
        }

        let token = Uuid::new_v4().to_string();
        let entry = QueueEntry {
            token: token.clone(),
            queue: key.clone(),
            actor: actor.clone(),
            status: EntryStatus::Waiting,
            enqueued_at: now,
            admitted_at: None,
            expires_at: now + self.ttl(),
            closed_at: None,
        };
        state.entries.insert(token.clone(), entry);
        state.by_actor.insert(actor_key, token.clone());
        if let Some(queue) = state.queues.get_mut(key) {
            queue.waiting.push_back(token.clone());
            record_waiting(key, queue);
        }
        tracing::info!(queue = %key, %actor, "entered queue");
        state.view(&token)
    }

    /// Current status of an entry.
    pub async fn status(&self, token: &str) -> Result<EntryStatusView> {
        let mut state = self.state.lock().await;
        state.expire_overdue(Utc::now());
        state.view(token)
    }

    /// Withdraws an entry. Leaving twice is a no-op.
    #[tracing::instrument(skip(self))]
    pub async fn leave(&self, token: &str) -> Result<EntryStatusView> {
        let now = Utc::now();
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.expire_overdue(now);

        let entry = state
            .entries
            .get_mut(token)
            .ok_or_else(|| AdmissionError::EntryNotFound(token.to_string()))?;
        match entry.status {
            EntryStatus::Left => {}
            EntryStatus::Expired => {
                return Err(AdmissionError::EntryClosed {
                    token: token.to_string(),
                    status: EntryStatus::Expired.as_str(),
                });
            }
            EntryStatus::Waiting | EntryStatus::Admitted => {
                entry.close(EntryStatus::Left, now);
                if let Some(queue) = state.queues.get_mut(&entry.queue) {
                    queue.remove(token);
                    record_waiting(&entry.queue, queue);
                }
                tracing::info!(queue = %entry.queue, actor = %entry.actor, "left queue");
            }
        }
        state.view(token)
    }

    /// Releases an admitted slot once the actor is done with the purchase flow.
    #[tracing::instrument(skip(self))]
    pub async fn complete(&self, token: &str) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let entry = state
            .entries
            .get_mut(token)
            .ok_or_else(|| AdmissionError::EntryNotFound(token.to_string()))?;
        if entry.status != EntryStatus::Admitted {
            return Err(AdmissionError::NotAdmitted(token.to_string()));
        }
        entry.close(EntryStatus::Left, Utc::now());
        if let Some(queue) = state.queues.get_mut(&entry.queue) {
            queue.remove(token);
        }
        Ok(())
    }

    /// Admits the oldest waiting entries, up to the batch size and the
    /// remaining capacity. Returns the admitted tokens in admission order.
    #[tracing::instrument(skip(self))]
    pub async fn process_batch(&self, key: &QueueKey) -> Result<Vec<String>> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.expire_overdue(now);
        state.queue(key)?;

        let admitted = state.admit(key, now, self.ttl());
        if let Some(queue) = state.queues.get(key) {
            record_waiting(key, queue);
        }
        if !admitted.is_empty() {
            metrics::counter!("admission_admitted_total").increment(admitted.len() as u64);
            tracing::info!(queue = %key, admitted = admitted.len(), "batch admitted");
        }
        Ok(admitted)
    }

    /// True when no active queue gates the event, or `actor` holds an
    /// admitted entry in it.
    pub async fn validate_entry(&self, key: &QueueKey, actor: &ActorId) -> bool {
        let mut state = self.state.lock().await;
        state.expire_overdue(Utc::now());
        match state.queues.get(key) {
            Some(queue) if queue.active => state
                .by_actor
                .get(&(key.clone(), actor.clone()))
                .and_then(|token| state.entries.get(token))
                .is_some_and(|entry| entry.status == EntryStatus::Admitted),
            _ => true,
        }
    }

    /// Expires overdue entries, drops entries closed longer than the
    /// retention window, and admits a batch for every active queue whose
    /// interval has elapsed.
    pub async fn tick(&self) -> usize {
        let now = Utc::now();
        let instant = tokio::time::Instant::now();
        let mut state = self.state.lock().await;
        let expired = state.expire_overdue(now);
        if expired > 0 {
            tracing::debug!(expired, "expired overdue queue entries");
        }
        let pruned = state.prune_closed(now, self.retention());
        if pruned > 0 {
            tracing::debug!(pruned, "dropped closed queue entries");
        }

        let due: Vec<QueueKey> = state
            .queues
            .iter()
            .filter(|(_, q)| q.active && q.batch_due(instant))
            .map(|(k, _)| k.clone())
            .collect();

        let mut total = 0;
        for key in due {
            let admitted = state.admit(&key, now, self.ttl());
            if let Some(queue) = state.queues.get(&key) {
                record_waiting(&key, queue);
            }
            if !admitted.is_empty() {
                metrics::counter!("admission_admitted_total").increment(admitted.len() as u64);
                tracing::info!(queue = %key, admitted = admitted.len(), "batch admitted");
            }
            total += admitted.len();
        }
        total
    }

    /// Runs [`tick`](Self::tick) every `tick_interval` until `shutdown`
    /// flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval = ?self.config.tick_interval, "admission loop started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
        tracing::info!("admission loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn settings(max_capacity: usize, batch_size: usize) -> QueueSettings {
        QueueSettings {
            max_capacity,
            batch_size,
            batch_interval: Duration::from_secs(1),
        }
    }

    async fn controller_with_queue(max_capacity: usize, batch_size: usize) -> (AdmissionController, QueueKey) {
        let controller = AdmissionController::default();
        let key = QueueKey::new("timedeal", 1);
        controller
            .activate(key.clone(), settings(max_capacity, batch_size))
            .await
            .unwrap();
        (controller, key)
    }

    #[tokio::test]
    async fn test_batch_admits_oldest_up_to_capacity() {
        let (controller, key) = controller_with_queue(2, 10).await;
        let mut tokens = Vec::new();
        for name in ["A", "B", "C", "D", "E"] {
            let view = controller.enter(&key, &ActorId::new(name)).await.unwrap();
            tokens.push(view.token);
        }

        let admitted = controller.process_batch(&key).await.unwrap();
        assert_eq!(admitted, tokens[..2].to_vec());

        for token in &tokens[..2] {
            assert_eq!(
                controller.status(token).await.unwrap().status,
                EntryStatus::Admitted
            );
        }
        for (i, token) in tokens[2..].iter().enumerate() {
            let view = controller.status(token).await.unwrap();
            assert_eq!(view.status, EntryStatus::Waiting);
            assert_eq!(view.position, Some(i as u64 + 1));
            assert_eq!(view.total_waiting, 3);
        }

        assert!(controller.process_batch(&key).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_size_limits_each_batch() {
        let (controller, key) = controller_with_queue(10, 2).await;
        for i in 0..5 {
            controller
                .enter(&key, &ActorId::new(format!("u{i}")))
                .await
                .unwrap();
        }
        assert_eq!(controller.process_batch(&key).await.unwrap().len(), 2);
        assert_eq!(controller.process_batch(&key).await.unwrap().len(), 2);
        assert_eq!(controller.process_batch(&key).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reentering_returns_existing_token() {
        let (controller, key) = controller_with_queue(2, 1).await;
        let actor = ActorId::new("a");
        let first = controller.enter(&key, &actor).await.unwrap();
        let second = controller.enter(&key, &actor).await.unwrap();
        assert_eq!(first.token, second.token);
        assert_eq!(second.total_waiting, 1);
    }

    #[tokio::test]
    async fn test_leave_removes_from_line() {
        let (controller, key) = controller_with_queue(2, 1).await;
        let a = controller.enter(&key, &ActorId::new("a")).await.unwrap();
        let b = controller.enter(&key, &ActorId::new("b")).await.unwrap();

        let left = controller.leave(&a.token).await.unwrap();
        assert_eq!(left.status, EntryStatus::Left);
        assert_eq!(controller.status(&b.token).await.unwrap().position, Some(1));

        // leaving again is harmless, and the actor may enter anew
        controller.leave(&a.token).await.unwrap();
        let again = controller.enter(&key, &ActorId::new("a")).await.unwrap();
        assert_ne!(again.token, a.token);
    }

    #[tokio::test]
    async fn test_complete_frees_a_slot() {
        let (controller, key) = controller_with_queue(1, 5).await;
        let a = controller.enter(&key, &ActorId::new("a")).await.unwrap();
        let b = controller.enter(&key, &ActorId::new("b")).await.unwrap();

        assert_eq!(controller.process_batch(&key).await.unwrap(), vec![a.token.clone()]);
        assert!(controller.process_batch(&key).await.unwrap().is_empty());

        assert!(matches!(
            controller.complete(&b.token).await,
            Err(AdmissionError::NotAdmitted(_))
        ));
        controller.complete(&a.token).await.unwrap();
        assert_eq!(controller.process_batch(&key).await.unwrap(), vec![b.token]);
    }

    #[tokio::test]
    async fn test_validate_entry() {
        let (controller, key) = controller_with_queue(1, 1).await;
        let actor = ActorId::new("a");
        assert!(
            controller
                .validate_entry(&QueueKey::new("timedeal", 99), &actor)
                .await
        );
        assert!(!controller.validate_entry(&key, &actor).await);

        controller.enter(&key, &actor).await.unwrap();
        assert!(!controller.validate_entry(&key, &actor).await);
        controller.process_batch(&key).await.unwrap();
        assert!(controller.validate_entry(&key, &actor).await);
    }

    #[tokio::test]
    async fn test_deactivate_expires_waiting_and_rejects_entry() {
        let (controller, key) = controller_with_queue(1, 1).await;
        let a = controller.enter(&key, &ActorId::new("a")).await.unwrap();

        controller.deactivate(&key).await.unwrap();

        assert_eq!(
            controller.status(&a.token).await.unwrap().status,
            EntryStatus::Expired
        );
        assert!(matches!(
            controller.enter(&key, &ActorId::new("b")).await,
            Err(AdmissionError::QueueInactive { .. })
        ));
        assert!(controller.validate_entry(&key, &ActorId::new("b")).await);
    }

    #[tokio::test]
    async fn test_entry_past_ttl_is_expired_and_skipped() {
        let controller = AdmissionController::new(AdmissionConfig {
            entry_ttl: Duration::ZERO,
            ..AdmissionConfig::default()
        });
        let key = QueueKey::new("timedeal", 1);
        controller.activate(key.clone(), settings(5, 5)).await.unwrap();
        let a = controller.enter(&key, &ActorId::new("a")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(
            controller.status(&a.token).await.unwrap().status,
            EntryStatus::Expired
        );
        assert!(controller.process_batch(&key).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tick_drops_closed_entries_after_retention() {
        let controller = AdmissionController::new(AdmissionConfig {
            entry_retention: Duration::ZERO,
            ..AdmissionConfig::default()
        });
        let key = QueueKey::new("timedeal", 1);
        controller.activate(key.clone(), settings(5, 5)).await.unwrap();
        let a = controller.enter(&key, &ActorId::new("a")).await.unwrap();
        let b = controller.enter(&key, &ActorId::new("b")).await.unwrap();
        controller.leave(&a.token).await.unwrap();

        controller.tick().await;

        assert!(matches!(
            controller.status(&a.token).await,
            Err(AdmissionError::EntryNotFound(_))
        ));
        {
            let state = controller.state.lock().await;
            assert_eq!(state.entries.len(), 1);
            assert!(state.entries.contains_key(&b.token));
            assert_eq!(state.by_actor.len(), 1);
        }
        // b was admitted by the same tick and stays until it is closed
        assert_eq!(
            controller.status(&b.token).await.unwrap().status,
            EntryStatus::Admitted
        );

        let again = controller.enter(&key, &ActorId::new("a")).await.unwrap();
        assert_ne!(again.token, a.token);
        assert_eq!(again.status, EntryStatus::Waiting);
    }

    #[tokio::test]
    async fn test_closed_entries_are_kept_within_retention() {
        let (controller, key) = controller_with_queue(5, 5).await;
        let a = controller.enter(&key, &ActorId::new("a")).await.unwrap();
        controller.leave(&a.token).await.unwrap();

        controller.tick().await;

        assert_eq!(
            controller.status(&a.token).await.unwrap().status,
            EntryStatus::Left
        );
    }

    #[tokio::test]
    async fn test_unknown_queue_and_token() {
        let controller = AdmissionController::default();
        assert!(matches!(
            controller
                .enter(&QueueKey::new("x", 1), &ActorId::new("a"))
                .await,
            Err(AdmissionError::QueueNotFound { .. })
        ));
        assert!(matches!(
            controller.status("nope").await,
            Err(AdmissionError::EntryNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_admits_on_interval_and_stops_on_shutdown() {
        let (controller, key) = controller_with_queue(10, 1).await;
        let a = controller.enter(&key, &ActorId::new("a")).await.unwrap();
        let b = controller.enter(&key, &ActorId::new("b")).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn({
            let controller = controller.clone();
            async move { controller.run(shutdown_rx).await }
        });

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(
            controller.status(&a.token).await.unwrap().status,
            EntryStatus::Admitted
        );

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            controller.status(&b.token).await.unwrap().status,
            EntryStatus::Admitted
        );

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
