//! Multi-subscriber events
//!
//! [`Event`] is an observer list shared by cheap clones. Dispatch takes a
//! snapshot of the list and releases the lock before calling anyone, so a
//! handler may subscribe or unsubscribe (itself included) while it runs.
//! Removal marks the entry inactive and compacts the list; an entry that was
//! removed after the snapshot was taken is skipped.
//!
//! Every handler call is isolated: a panic is caught, logged and returned to
//! the emitter as a [`BytesIoError::Callback`] so the remaining handlers
//! still run.
//!
//! ```rust
//! use bytesio::event::Event;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let event = Event::<u32>::new("ticks");
//! let seen = Arc::new(AtomicUsize::new(0));
//! let counter = seen.clone();
//! let id = event.subscribe(move |n| {
//!     counter.fetch_add(*n as usize, Ordering::SeqCst);
//! });
//!
//! event.emit(&2);
//! event.unsubscribe(id);
//! event.emit(&5);
//! assert_eq!(seen.load(Ordering::SeqCst), 2);
//! ```

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::warn;

use crate::error::BytesIoError;

/// Handle identifying one subscription on one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler<T> = Box<dyn Fn(&T) + Send + Sync>;

struct Subscriber<T> {
    id: u64,
    active: AtomicBool,
    handler: Handler<T>,
}

struct EventShared<T> {
    name: &'static str,
    subscribers: Mutex<Vec<Arc<Subscriber<T>>>>,
    next_id: AtomicU64,
}

impl<T> EventShared<T> {
    fn remove(&self, id: u64) -> bool {
        let mut subscribers = self.subscribers.lock();
        let mut removed = false;
        for subscriber in subscribers.iter().filter(|s| s.id == id) {
            subscriber.active.store(false, Ordering::Release);
            removed = true;
        }
        subscribers.retain(|s| s.active.load(Ordering::Acquire));
        removed
    }
}

/// Observer list for values of type `T`.
pub struct Event<T> {
    shared: Arc<EventShared<T>>,
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Event<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            shared: Arc::new(EventShared {
                name,
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    /// Add a handler that stays registered until [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.subscribers.lock().push(Arc::new(Subscriber {
            id,
            active: AtomicBool::new(true),
            handler: Box::new(handler),
        }));
        SubscriptionId(id)
    }

    /// Add a handler that is removed when the returned guard is dropped.
    pub fn subscribe_scoped<F>(&self, handler: F) -> Subscription<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.subscribe(handler);
        Subscription {
            event: Arc::downgrade(&self.shared),
            id: Some(id),
        }
    }

    /// Remove a handler. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.remove(id.0)
    }

    pub fn clear(&self) {
        let mut subscribers = self.shared.subscribers.lock();
        for subscriber in subscribers.iter() {
            subscriber.active.store(false, Ordering::Release);
        }
        subscribers.clear();
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.shared.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call every active handler in registration order.
    ///
    /// Returns one error per handler that panicked.
    pub fn emit(&self, args: &T) -> Vec<BytesIoError> {
        let snapshot: Vec<Arc<Subscriber<T>>> = self.shared.subscribers.lock().clone();
        let mut failures = Vec::new();

        for subscriber in snapshot {
            if !subscriber.active.load(Ordering::Acquire) {
                continue;
            }
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| (subscriber.handler)(args))) {
                let error = BytesIoError::from_panic(payload);
                warn!("Handler on '{}' panicked: {}", self.shared.name, error);
                failures.push(error);
            }
        }
        failures
    }
}

impl<T> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("name", &self.shared.name)
            .field("subscribers", &self.len())
            .finish()
    }
}

/// Guard that unsubscribes its handler on drop.
#[must_use = "dropping the guard unsubscribes immediately"]
pub struct Subscription<T> {
    event: Weak<EventShared<T>>,
    id: Option<SubscriptionId>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> Option<SubscriptionId> {
        self.id
    }

    /// Keep the handler registered after the guard goes away.
    pub fn detach(mut self) -> Option<SubscriptionId> {
        self.id.take()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let (Some(id), Some(event)) = (self.id.take(), self.event.upgrade()) {
            event.remove(id.0);
        }
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_emit_in_registration_order() {
        let event = Event::<u8>::new("order");
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..3u8 {
            let log = log.clone();
            event.subscribe(move |v| log.lock().push((tag, *v)));
        }
        assert!(event.emit(&7).is_empty());
        assert_eq!(*log.lock(), vec![(0, 7), (1, 7), (2, 7)]);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let event = Event::<()>::new("faulty");
        let after = Arc::new(AtomicUsize::new(0));
        event.subscribe(|_| panic!("boom"));
        let counter = after.clone();
        event.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let failures = event.emit(&());
        assert_eq!(failures, vec![BytesIoError::callback("boom")]);
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_can_unsubscribe_itself() {
        let event = Event::<()>::new("once");
        let calls = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));

        let handle = event.clone();
        let counter = calls.clone();
        let own_id = slot.clone();
        let id = event.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = own_id.lock().take() {
                handle.unsubscribe(id);
            }
        });
        *slot.lock() = Some(id);

        event.emit(&());
        event.emit(&());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(event.is_empty());
    }

    #[test]
    fn test_removal_mid_dispatch_skips_later_handler() {
        let event = Event::<()>::new("mid");
        let second_calls = Arc::new(AtomicUsize::new(0));
        let victim: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));

        let handle = event.clone();
        let target = victim.clone();
        event.subscribe(move |_| {
            if let Some(id) = *target.lock() {
                handle.unsubscribe(id);
            }
        });
        let counter = second_calls.clone();
        let id = event.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        *victim.lock() = Some(id);

        event.emit(&());
        assert_eq!(second_calls.load(Ordering::SeqCst), 0);
        assert_eq!(event.len(), 1);
    }

    #[test]
    fn test_scoped_subscription_unsubscribes_on_drop() {
        let event = Event::<u32>::new("scoped");
        let guard = event.subscribe_scoped(|_| {});
        assert_eq!(event.len(), 1);
        drop(guard);
        assert!(event.is_empty());

        let kept = event.subscribe_scoped(|_| {}).detach();
        assert!(kept.is_some());
        assert_eq!(event.len(), 1);
        assert!(event.unsubscribe(kept.unwrap()));
        assert!(!event.unsubscribe(kept.unwrap()));
    }

    #[test]
    fn test_guard_outliving_event_is_harmless() {
        let event = Event::<u32>::new("gone");
        let guard = event.subscribe_scoped(|_| {});
        drop(event);
        drop(guard);
    }
}
