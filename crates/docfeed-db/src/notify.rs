//! In-process publish/subscribe for committed inserts.
//!
//! SQLite has no LISTEN/NOTIFY, so the pool's commit hook queues staged
//! trigger notifications on a [`NotifyHub`] in commit order. A flush after
//! the commit is visible releases them, and the hub fans them out to every
//! [`Subscription`] on the named channel through a bounded broadcast
//! channel. A subscriber that falls more than `channel_capacity`
//! notifications behind observes [`SubscriptionError::Lagged`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::broadcast;

use docfeed_types::Notification;

/// Tunables for the notification hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifySettings {
    /// Per-channel broadcast buffer size.
    pub channel_capacity: usize,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

/// Errors observed while waiting on a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    /// The subscriber fell behind and this many notifications were dropped.
    #[error("subscription lagged, {0} notifications were dropped")]
    Lagged(u64),

    /// The channel was shut down.
    #[error("subscription channel closed")]
    Closed,
}

/// Committed notifications waiting for a flush, in commit order.
#[derive(Debug, Default)]
struct CommitQueue {
    /// Sequence number of `pending[0]`.
    released: u64,
    pending: VecDeque<Notification>,
}

/// Routes committed notifications to channel subscribers.
#[derive(Debug)]
pub struct NotifyHub {
    channels: Mutex<HashMap<String, broadcast::Sender<Notification>>>,
    committed: Mutex<CommitQueue>,
    settings: NotifySettings,
}

impl NotifyHub {
    /// Creates an empty hub.
    pub fn new(settings: NotifySettings) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            committed: Mutex::new(CommitQueue::default()),
            settings,
        }
    }

    /// Queues a committed batch and returns the sequence mark that releases
    /// it.
    ///
    /// Called from a commit hook, which SQLite serializes across writers, so
    /// queue order is commit order.
    pub(crate) fn enqueue_committed(&self, batch: Vec<Notification>) -> u64 {
        let mut queue = self
            .committed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        queue.pending.extend(batch);
        queue.released + queue.pending.len() as u64
    }

    /// Publishes every queued notification with a sequence number below
    /// `mark`, oldest first. Returns how many were published.
    ///
    /// A writer's commit only starts once every earlier commit has finished,
    /// so once the batch ending at `mark` is visible, everything queued
    /// before it is visible too.
    pub(crate) fn release_through(&self, mark: u64) -> usize {
        let mut queue = self
            .committed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut published = 0;
        while queue.released < mark {
            let Some(notification) = queue.pending.pop_front() else {
                break;
            };
            queue.released += 1;
            self.publish(notification);
            published += 1;
        }
        published
    }

    /// Publishes a notification to the current subscribers of its channel.
    ///
    /// Returns the number of subscribers that received it. Notifications on
    /// channels with no subscribers are dropped.
    pub fn publish(&self, notification: Notification) -> usize {
        let sender = match self.channels.lock() {
            Ok(channels) => channels.get(&notification.channel).cloned(),
            Err(_) => {
                tracing::error!("notify hub lock poisoned, dropping notification");
                return 0;
            }
        };

        match sender {
            Some(tx) => {
                let channel = notification.channel.clone();
                match tx.send(notification) {
                    Ok(count) => count,
                    Err(_) => {
                        tracing::debug!(%channel, "no live receivers for notification");
                        0
                    }
                }
            }
            None => 0,
        }
    }

    /// Subscribes to `channel`.
    ///
    /// The returned [`Subscription`] unsubscribes when dropped.
    pub fn listen(self: &Arc<Self>, channel: &str) -> Subscription {
        let rx = {
            let mut channels = self
                .channels
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(self.settings.channel_capacity).0)
                .subscribe()
        };

        tracing::debug!(channel, "subscribed to notification channel");

        Subscription {
            channel: channel.to_string(),
            rx: Some(rx),
            hub: Arc::clone(self),
        }
    }

    /// Returns the number of live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .map(|channels| {
                channels
                    .get(channel)
                    .map(broadcast::Sender::receiver_count)
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    fn release(&self, channel: &str) {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let idle = channels
            .get(channel)
            .map(|tx| tx.receiver_count() == 0)
            .unwrap_or(false);
        if idle {
            channels.remove(channel);
        }
        tracing::debug!(channel, "unsubscribed from notification channel");
    }
}

/// A live subscription to one notification channel.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    rx: Option<broadcast::Receiver<Notification>>,
    hub: Arc<NotifyHub>,
}

impl Subscription {
    /// The channel this subscription listens on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Waits for the next notification.
    ///
    /// # Errors
    ///
    /// Returns `SubscriptionError::Lagged` if notifications were dropped
    /// because this subscriber fell behind, or `SubscriptionError::Closed`
    /// if the channel shut down.
    pub async fn recv(&mut self) -> Result<Notification, SubscriptionError> {
        let rx = self.rx.as_mut().ok_or(SubscriptionError::Closed)?;
        rx.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Lagged(n) => SubscriptionError::Lagged(n),
            broadcast::error::RecvError::Closed => SubscriptionError::Closed,
        })
    }

    /// Returns an already-buffered notification without waiting.
    pub fn try_recv(&mut self) -> Option<Notification> {
        self.rx.as_mut().and_then(|rx| rx.try_recv().ok())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // The receiver has to go before release() counts receivers.
        drop(self.rx.take());
        self.hub.release(&self.channel);
    }
}
