//! Per-key broadcast channels that replay their last item.
//!
//! A [`Channel`] keeps the most recent [`Notification`] and a set of
//! subscriber queues. Subscribing replays the last item, then delivers every
//! later item in publish order. Items are never coalesced: a slow subscriber
//! sees every value, miss and error.
//!
//! [`ChannelRegistry`] lazily creates one channel per key and keeps it until
//! [`ChannelRegistry::close_all`].

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::channel::mpsc;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use slab::Slab;

use crate::key::{CacheKey, Notification};

struct ChannelState<T> {
    /// Last item published, replayed to new subscribers.
    last: Option<Notification<T>>,
    /// Last value or miss. Errors do not displace it.
    latest: Option<Arc<T>>,
    subscribers: Slab<mpsc::UnboundedSender<Notification<T>>>,
    closed: bool,
}

/// Broadcast channel for one key.
pub(crate) struct Channel<T> {
    state: Mutex<ChannelState<T>>,
}

impl<T> Channel<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChannelState {
                last: None,
                latest: None,
                subscribers: Slab::new(),
                closed: false,
            }),
        }
    }

    /// A channel that is already closed. Subscribing to it yields an ended stream.
    pub fn closed() -> Self {
        let channel = Self::new();
        channel.state.lock().closed = true;
        channel
    }

    /// Push an item to every subscriber and remember it for replay.
    ///
    /// Subscribers whose stream was dropped are pruned. Publishing to a closed
    /// channel does nothing.
    pub fn publish(&self, item: Notification<T>) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        match &item {
            Notification::Value(value) => state.latest = Some(value.clone()),
            Notification::Miss => state.latest = None,
            Notification::Error(_) => {}
        }
        state
            .subscribers
            .retain(|_, tx| tx.unbounded_send(item.clone()).is_ok());
        state.last = Some(item);
    }

    /// Subscribe, receiving the last item first if there is one.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded();
        let mut state = self.state.lock();
        if !state.closed {
            if let Some(last) = &state.last {
                // The receiver is alive, this cannot fail.
                let _ = tx.unbounded_send(last.clone());
            }
            state.subscribers.insert(tx);
        }
        Subscription { rx }
    }

    /// The latest value, or `None` for a miss.
    pub fn latest(&self) -> Option<Arc<T>> {
        self.state.lock().latest.clone()
    }

    /// Close the channel. Open subscriptions end once they drain queued items.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.subscribers.clear();
        state.last = None;
        state.latest = None;
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }
}

/// A live stream of [`Notification`]s for one key.
///
/// Returned by [`QueryCache::get_stream`](crate::QueryCache::get_stream).
/// The stream ends when the cache is disposed.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<Notification<T>>,
}

impl<T> Stream for Subscription<T> {
    type Item = Notification<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_next_unpin(cx)
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// Lazily created channels, one per key.
pub(crate) struct ChannelRegistry<K, T> {
    channels: HashMap<K, Arc<Channel<T>>>,
    closed: bool,
}

impl<K: CacheKey, T> ChannelRegistry<K, T> {
    pub fn new() -> Self {
        Self {
            channels: HashMap::new(),
            closed: false,
        }
    }

    /// The channel for `key`, created on first access.
    ///
    /// Once the registry is closed this hands out a fresh closed channel and
    /// records nothing.
    pub fn channel_for(&mut self, key: &K) -> Arc<Channel<T>> {
        if self.closed {
            return Arc::new(Channel::closed());
        }
        self.channels
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Channel::new()))
            .clone()
    }

    pub fn get(&self, key: &K) -> Option<&Arc<Channel<T>>> {
        self.channels.get(key)
    }

    /// The latest value pushed for `key`, or `None` if there is none or the key is unknown.
    pub fn latest_value(&self, key: &K) -> Option<Arc<T>> {
        self.channels.get(key).and_then(|channel| channel.latest())
    }

    /// Publish to `key`'s channel, creating it if needed.
    pub fn publish(&mut self, key: &K, item: Notification<T>) {
        self.channel_for(key).publish(item);
    }

    /// Publish `Miss` to every existing channel.
    pub fn publish_miss_to_all(&self) {
        for channel in self.channels.values() {
            channel.publish(Notification::Miss);
        }
    }

    /// Close every channel and forget them. Further lookups get closed channels.
    pub fn close_all(&mut self) -> usize {
        self.closed = true;
        let count = self.channels.len();
        for (_, channel) in self.channels.drain() {
            channel.close();
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn next_now<T>(sub: &mut Subscription<T>) -> Option<Option<Notification<T>>> {
        sub.next().now_or_never()
    }

    #[test]
    fn test_new_channel_has_no_item() {
        let channel: Channel<i32> = Channel::new();
        let mut sub = channel.subscribe();
        assert!(next_now(&mut sub).is_none());
        assert!(channel.latest().is_none());
    }

    #[test]
    fn test_replays_last_item_to_late_subscriber() {
        let channel = Channel::new();
        channel.publish(Notification::Value(Arc::new(1)));
        channel.publish(Notification::Value(Arc::new(2)));

        let mut sub = channel.subscribe();
        let item = next_now(&mut sub).flatten().unwrap();
        assert_eq!(item.value().map(|v| **v), Some(2));
        assert!(next_now(&mut sub).is_none());
    }

    #[test]
    fn test_delivers_every_item_in_order() {
        let channel = Channel::new();
        let mut sub = channel.subscribe();

        channel.publish(Notification::Value(Arc::new("a")));
        channel.publish(Notification::Miss);
        channel.publish(Notification::Value(Arc::new("b")));

        assert_eq!(
            next_now(&mut sub).flatten().unwrap().value().map(|v| **v),
            Some("a")
        );
        assert!(next_now(&mut sub).flatten().unwrap().is_miss());
        assert_eq!(
            next_now(&mut sub).flatten().unwrap().value().map(|v| **v),
            Some("b")
        );
    }

    #[test]
    fn test_error_does_not_displace_latest_value() {
        let channel = Channel::new();
        channel.publish(Notification::Value(Arc::new(5)));
        channel.publish(Notification::Error(crate::CacheError::Cancelled));
        assert_eq!(channel.latest().map(|v| *v), Some(5));

        // The error is still the replayed item.
        let mut sub = channel.subscribe();
        assert!(next_now(&mut sub).flatten().unwrap().error().is_some());

        channel.publish(Notification::Miss);
        assert!(channel.latest().is_none());
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let channel = Channel::new();
        let sub = channel.subscribe();
        let _kept = channel.subscribe();
        assert_eq!(channel.subscriber_count(), 2);

        drop(sub);
        channel.publish(Notification::Value(Arc::new(1)));
        assert_eq!(channel.subscriber_count(), 1);
    }

    #[test]
    fn test_close_ends_streams() {
        let channel = Channel::new();
        let mut sub = channel.subscribe();
        channel.publish(Notification::Value(Arc::new(1)));
        channel.close();

        // Queued item drains, then the stream ends.
        assert!(next_now(&mut sub).flatten().is_some());
        assert!(matches!(next_now(&mut sub), Some(None)));

        // Late subscribers get an ended stream and publishing is ignored.
        channel.publish(Notification::Value(Arc::new(2)));
        let mut late = channel.subscribe();
        assert!(matches!(next_now(&mut late), Some(None)));
        assert!(channel.is_closed());
        assert!(channel.latest().is_none());
    }

    #[test]
    fn test_registry_one_channel_per_key() {
        let mut registry: ChannelRegistry<&'static str, i32> = ChannelRegistry::new();
        let a1 = registry.channel_for(&"a");
        let a2 = registry.channel_for(&"a");
        assert!(Arc::ptr_eq(&a1, &a2));
        assert_eq!(registry.len(), 1);

        registry.publish(&"b", Notification::Value(Arc::new(7)));
        assert_eq!(registry.latest_value(&"b").map(|v| *v), Some(7));
        assert!(registry.latest_value(&"unknown").is_none());
        assert!(registry.get(&"unknown").is_none());
    }

    #[test]
    fn test_registry_miss_to_all() {
        let mut registry: ChannelRegistry<u8, i32> = ChannelRegistry::new();
        registry.publish(&1, Notification::Value(Arc::new(1)));
        registry.publish(&2, Notification::Value(Arc::new(2)));

        registry.publish_miss_to_all();
        assert!(registry.latest_value(&1).is_none());
        assert!(registry.latest_value(&2).is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_registry_close_all() {
        let mut registry: ChannelRegistry<u8, i32> = ChannelRegistry::new();
        let channel = registry.channel_for(&1);
        assert_eq!(registry.close_all(), 1);

        assert!(channel.is_closed());
        assert!(registry.is_closed());
        assert_eq!(registry.len(), 0);

        let after = registry.channel_for(&1);
        assert!(after.is_closed());
        assert_eq!(registry.len(), 0);
    }
}
