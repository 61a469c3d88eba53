use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;

use super::cache_key::CacheKey;
use super::memory::Cached;

/// The per-key registry of change subscribers.
///
/// Publishing happens synchronously from inside the cache's critical sections, so
/// an observer that subscribes before a mutation is guaranteed to see it. Streams
/// never replay: a subscriber only sees state transitions from the moment of
/// subscription onward.
pub(super) struct ChangeNotifier<T> {
    subscribers: FxHashMap<CacheKey, Vec<mpsc::UnboundedSender<Option<Cached<T>>>>>,
}

impl<T: Clone> ChangeNotifier<T> {
    pub fn new() -> Self {
        ChangeNotifier {
            subscribers: FxHashMap::default(),
        }
    }

    pub fn subscribe(&mut self, key: CacheKey) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.entry(key).or_default().push(tx);
        Subscription { rx }
    }

    /// Pushes the post-mutation state of `key` to its subscribers.
    ///
    /// Dropped subscriptions are pruned on the way.
    pub fn publish(&mut self, key: &CacheKey, state: Option<Cached<T>>) {
        let Some(senders) = self.subscribers.get_mut(key) else {
            return;
        };

        senders.retain(|tx| tx.send(state.clone()).is_ok());
        if senders.is_empty() {
            self.subscribers.remove(key);
        }
    }

    /// Drops all registrations, terminating every subscriber stream.
    pub fn close(&mut self) {
        self.subscribers.clear();
    }
}

/// A push-based stream of cache change notifications for one key.
///
/// Yields the current entry state after every store or invalidation of the key:
/// `Some` with the stored value and its staleness flag, or `None` when the entry
/// was removed. The stream ends when the cache is closed.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<Option<Cached<T>>>,
}

impl<T> Subscription<T> {
    /// Creates a subscription whose stream has already ended.
    ///
    /// Handed out when subscribing to a closed cache, so such streams terminate
    /// immediately instead of pending forever on a notifier that will never
    /// publish again.
    pub(super) fn terminated() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(tx);
        Subscription { rx }
    }

    /// Waits for the next change notification.
    ///
    /// Returns `None` once the cache has been closed.
    pub async fn recv(&mut self) -> Option<Option<Cached<T>>> {
        self.rx.recv().await
    }

    /// Returns the next change notification if one is already queued.
    pub fn try_recv(&mut self) -> Option<Option<Cached<T>>> {
        self.rx.try_recv().ok()
    }
}

impl<T> Stream for Subscription<T> {
    type Item = Option<Cached<T>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
