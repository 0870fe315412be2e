//! Push-based observable values
//!
//! An `Observable<T>` holds the latest value and a list of subscribers.
//! `set` notifies every subscriber synchronously; `subscribe` replays the
//! current value to the new subscriber before returning. Dropping the
//! returned `Subscription` unsubscribes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Inner<T> {
    value: RwLock<T>,
    subscribers: Mutex<Vec<(u64, Callback<T>)>>,
    next_id: AtomicU64,
}

/// Shared observable value; clones refer to the same store
pub struct Observable<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Observable {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Observable<T> {
    pub fn new(value: T) -> Self {
        Observable {
            inner: Arc::new(Inner {
                value: RwLock::new(value),
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Current value
    pub fn get(&self) -> T {
        self.inner.value.read().clone()
    }

    /// Borrow the current value without cloning it
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.value.read())
    }

    /// Replace the value and notify subscribers
    pub fn set(&self, value: T) {
        *self.inner.value.write() = value;
        self.notify();
    }

    /// Mutate the value in place and notify subscribers
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = f(&mut self.inner.value.write());
        self.notify();
        result
    }

    /// Mutate the value in place; subscribers are notified only when `f`
    /// reports a change in the first tuple field
    pub fn update_if<R>(&self, f: impl FnOnce(&mut T) -> (bool, R)) -> R {
        let (changed, result) = f(&mut self.inner.value.write());
        if changed {
            self.notify();
        }
        result
    }

    /// Register a subscriber; it is called immediately with the current value
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let callback: Callback<T> = Arc::new(callback);
        self.inner
            .subscribers
            .lock()
            .push((id, Arc::clone(&callback)));

        let current = self.get();
        callback(&current);

        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.subscribers.lock().retain(|(sid, _)| *sid != id);
            }
        })
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    fn notify(&self) {
        // Callbacks run without any lock held so they may read or set
        // this observable themselves.
        let value = self.get();
        let callbacks: Vec<Callback<T>> = self
            .inner
            .subscribers
            .lock()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(&value);
        }
    }
}

impl<T: Clone + Send + Sync + Default + 'static> Default for Observable<T> {
    fn default() -> Self {
        Observable::new(T::default())
    }
}

impl<T: Clone + Send + Sync + std::fmt::Debug + 'static> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("value", &*self.inner.value.read())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Handle that removes a subscriber when dropped
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Subscription {
            cancel: Some(Box::new(cancel)),
        }
    }

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

    #[test]
    fn test_subscribe_replays_current_value() {
        let observable = Observable::new(5u32);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = observable.subscribe(move |v| sink.lock().push(*v));
        assert_eq!(*seen.lock(), vec![5]);
    }

    #[test]
    fn test_set_notifies_synchronously() {
        let observable = Observable::new(0u32);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = observable.subscribe(move |v| sink.lock().push(*v));

        observable.set(1);
        observable.update(|v| *v += 1);
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_update_if_skips_unchanged() {
        let observable = Observable::new(0u32);
        let seen = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&seen);
        let _sub = observable.subscribe(move |_| *sink.lock() += 1);

        let doubled = observable.update_if(|v| (false, *v * 2));
        assert_eq!(doubled, 0);
        observable.update_if(|v| {
            *v = 4;
            (true, ())
        });
        assert_eq!(*seen.lock(), 2);
        assert_eq!(observable.get(), 4);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let observable = Observable::new(0u32);
        let seen = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&seen);
        let sub = observable.subscribe(move |_| *sink.lock() += 1);
        assert_eq!(observable.subscriber_count(), 1);

        drop(sub);
        assert_eq!(observable.subscriber_count(), 0);
        observable.set(3);
        assert_eq!(*seen.lock(), 1);
    }

    #[test]
    fn test_subscriber_may_read_inside_callback() {
        let observable = Observable::new(1u32);
        let reader = observable.clone();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = observable.subscribe(move |v| sink.lock().push(*v + reader.get()));
        observable.set(2);
        assert_eq!(*seen.lock(), vec![2, 4]);
    }
}
