//! Observer registry with RAII subscriptions.
//!
//! Callbacks are invoked outside the registry lock, so a callback may
//! subscribe, unsubscribe or read the owning component without deadlocking.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    callbacks: Vec<(u64, Callback<T>)>,
}

/// A set of callbacks notified with `&T`.
pub struct Observers<T> {
    inner: Arc<Mutex<Registry<T>>>,
}

impl<T: 'static> Observers<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                callbacks: Vec::new(),
            })),
        }
    }

    /// Register `callback`. Dropping the returned handle unsubscribes.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut reg = self.inner.lock();
            let id = reg.next_id;
            reg.next_id += 1;
            reg.callbacks.push((id, Arc::new(callback)));
            id
        };

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.lock().callbacks.retain(|(cid, _)| *cid != id);
            }
        })
    }

    /// Invoke `callback` with `current` first, then register it.
    pub fn subscribe_with_current<F>(&self, current: &T, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        callback(current);
        self.subscribe(callback)
    }

    /// Notify every registered callback, in registration order.
    pub fn notify(&self, value: &T) {
        let callbacks: Vec<Callback<T>> = self
            .inner
            .lock()
            .callbacks
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for cb in callbacks {
            cb(value);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every callback. Outstanding handles become no-ops.
    pub fn clear(&self) {
        self.inner.lock().callbacks.clear();
    }
}

impl<T: 'static> Default for Observers<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by `subscribe`. Unsubscribes on drop.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    disposer: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    fn new(disposer: impl FnOnce() + Send + 'static) -> Self {
        Self {
            disposer: Some(Box::new(disposer)),
        }
    }

    /// Unsubscribe now.
    pub fn unsubscribe(mut self) {
        if let Some(dispose) = self.disposer.take() {
            dispose();
        }
    }

    /// Keep the callback registered for the life of the owning component.
    pub fn detach(mut self) {
        self.disposer = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(dispose) = self.disposer.take() {
            dispose();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.disposer.is_some())
            .finish()
    }
}
