//! Server-push status subscriptions.
//!
//! Subscriptions live in a registry owned by the [`AdmissionController`],
//! keyed by entry token, at most one per token. Each subscription is a
//! spawned task that pushes the entry's status immediately and then on
//! every push interval. It ends when the entry stops waiting, when the
//! absolute timeout passes, when the receiver goes away, or when it is
//! replaced or closed. Its registry slot is removed in every case.

use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::controller::AdmissionController;
use crate::error::Result;
use crate::queue::{EntryStatus, EntryStatusView};

#[derive(Debug)]
pub(crate) struct SubscriptionHandle {
    id: u64,
    cancel: oneshot::Sender<()>,
}

/// Stream of status pushes for one entry token.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<EntryStatusView>,
}

impl Stream for Subscription {
    type Item = EntryStatusView;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    Finished,
    TimedOut,
    Disconnected,
    Cancelled,
    EntryGone,
}

impl CloseReason {
    fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Finished => "finished",
            CloseReason::TimedOut => "timed_out",
            CloseReason::Disconnected => "disconnected",
            CloseReason::Cancelled => "cancelled",
            CloseReason::EntryGone => "entry_gone",
        }
    }
}

impl AdmissionController {
    /// Opens a status subscription for `token`, closing any previous one.
    pub async fn subscribe(&self, token: &str) -> Result<Subscription> {
        // fail fast on unknown tokens
        self.status(token).await?;

        let (tx, rx) = mpsc::channel(4);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);

        let previous = self.subscriptions.lock().await.insert(
            token.to_string(),
            SubscriptionHandle {
                id,
                cancel: cancel_tx,
            },
        );
        if let Some(previous) = previous {
            let _ = previous.cancel.send(());
        }

        let controller = self.clone();
        let token = token.to_string();
        tokio::spawn(async move {
            let reason = controller.push_status(&token, &tx, cancel_rx).await;
            controller.unregister(&token, id).await;
            tracing::debug!(%token, reason = reason.as_str(), "subscription closed");
            drop(tx);
        });

        Ok(Subscription { rx })
    }

    /// Closes every open subscription.
    pub async fn close_all(&self) {
        let handles: Vec<SubscriptionHandle> = self
            .subscriptions
            .lock()
            .await
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        let closed = handles.len();
        for handle in handles {
            let _ = handle.cancel.send(());
        }
        tracing::info!(closed, "closed all queue subscriptions");
    }

    /// Number of open subscriptions.
    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.lock().await.len()
    }

    async fn push_status(
        &self,
        token: &str,
        tx: &mpsc::Sender<EntryStatusView>,
        mut cancel: oneshot::Receiver<()>,
    ) -> CloseReason {
        let deadline = Instant::now() + self.config.stream_timeout;
        let mut ticker = tokio::time::interval(self.config.push_interval);

        loop {
            tokio::select! {
                _ = &mut cancel => return CloseReason::Cancelled,
                _ = tokio::time::sleep_until(deadline) => return CloseReason::TimedOut,
                _ = tx.closed() => return CloseReason::Disconnected,
                _ = ticker.tick() => {
                    let Ok(view) = self.status(token).await else {
                        return CloseReason::EntryGone;
                    };
                    let done = view.status != EntryStatus::Waiting;
                    if tx.send(view).await.is_err() {
                        return CloseReason::Disconnected;
                    }
                    if done {
                        return CloseReason::Finished;
                    }
                }
            }
        }
    }

    /// Removes the registry slot if it still belongs to subscription `id`.
    async fn unregister(&self, token: &str, id: u64) {
        let mut subscriptions = self.subscriptions.lock().await;
        if subscriptions.get(token).is_some_and(|h| h.id == id) {
            subscriptions.remove(token);
        }
    }
}
