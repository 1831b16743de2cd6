//! Asset events
//!
//! Each topic keeps its own subscriber list. Listeners run synchronously,
//! in subscription order, on whichever thread emits. A panicking listener
//! is logged and skipped.
//!
//! `subscribe` returns a `Subscription`; dropping it unsubscribes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::logging::ScopedLog;

/// An asset finished loading
#[derive(Debug, Clone, PartialEq)]
pub struct AssetReady<R> {
    pub id: String,
    pub asset: R,
}

/// Load progress for an asset, in `[0, 1]`
#[derive(Debug, Clone, PartialEq)]
pub struct AssetProgress {
    pub id: String,
    pub percent: f32,
}

/// An asset failed to load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetFailed {
    pub id: String,
    pub reason: String,
}

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct TopicInner<E> {
    listeners: RwLock<Vec<(u64, Listener<E>)>>,
    next_id: AtomicU64,
}

/// Subscriber list for one event type
pub struct EventTopic<E> {
    name: &'static str,
    inner: Arc<TopicInner<E>>,
    log: ScopedLog,
}

impl<E: 'static> EventTopic<E> {
    /// Topic with no listeners; `name` tags panic logs
    pub fn new(name: &'static str, log: ScopedLog) -> Self {
        Self {
            name,
            inner: Arc::new(TopicInner {
                listeners: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
            log,
        }
    }

    /// Topic name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Add a listener; it stays subscribed while the returned guard lives
    #[must_use = "dropping the Subscription unsubscribes immediately"]
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.write().push((id, Arc::new(listener)));

        let weak: Weak<TopicInner<E>> = Arc::downgrade(&self.inner);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.listeners.write().retain(|(other, _)| *other != id);
                }
            })),
        }
    }

    /// Deliver `event` to every current listener
    pub fn emit(&self, event: &E) {
        // Snapshot so listeners may (un)subscribe while being called
        let listeners: Vec<Listener<E>> = self
            .inner
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for listener in listeners {
            self.log.guarded(self.name, || listener(event));
        }
    }

    /// Number of registered listeners
    pub fn subscriber_count(&self) -> usize {
        self.inner.listeners.read().len()
    }
}

/// Guard for a topic listener
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Unsubscribe now
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn topic() -> EventTopic<AssetFailed> {
        EventTopic::new("asset_failed", ScopedLog::disabled())
    }

    fn failed(id: &str) -> AssetFailed {
        AssetFailed {
            id: id.to_string(),
            reason: "404".to_string(),
        }
    }

    #[test]
    fn test_subscription_order() {
        let topic = topic();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&order);
        let _a = topic.subscribe(move |e: &AssetFailed| first.lock().push(format!("a:{}", e.id)));
        let second = Arc::clone(&order);
        let _b = topic.subscribe(move |e: &AssetFailed| second.lock().push(format!("b:{}", e.id)));

        topic.emit(&failed("x"));
        assert_eq!(*order.lock(), vec!["a:x", "b:x"]);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let topic = topic();
        let count = Arc::new(AtomicU64::new(0));

        let counter = Arc::clone(&count);
        let subscription = topic.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(topic.subscriber_count(), 1);

        topic.emit(&failed("x"));
        drop(subscription);
        topic.emit(&failed("x"));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(topic.subscriber_count(), 0);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let topic = topic();
        let count = Arc::new(AtomicU64::new(0));

        let _bad = topic.subscribe(|_| panic!("listener bug"));
        let counter = Arc::clone(&count);
        let _good = topic.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        topic.emit(&failed("x"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscription_outlives_topic() {
        let topic = topic();
        let subscription = topic.subscribe(|_| {});
        drop(topic);
        subscription.unsubscribe();
    }
}
