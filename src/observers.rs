//! Callback registries with handle-based unsubscription.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    callbacks: BTreeMap<u64, Callback<T>>,
}

/// Set of callbacks notified in registration order.
pub(crate) struct Observers<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T: 'static> Observers<T> {
    pub(crate) fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                callbacks: BTreeMap::new(),
            })),
        }
    }

    pub(crate) fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = self.registry.lock();
            registry.next_id += 1;
            let id = registry.next_id;
            registry.callbacks.insert(id, Arc::new(callback));
            id
        };

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription {
            detach: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    registry.lock().callbacks.remove(&id);
                }
            })),
        }
    }

    /// Call every callback with `value`. Callbacks run outside the lock, so
    /// they may subscribe or unsubscribe.
    pub(crate) fn notify(&self, value: &T) {
        let callbacks: Vec<Callback<T>> = self.registry.lock().callbacks.values().cloned().collect();
        for callback in callbacks {
            callback(value);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.registry.lock().callbacks.len()
    }
}

/// Handle for a registered callback. Dropping it detaches the callback.
#[must_use = "dropping a Subscription immediately unsubscribes"]
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }

    /// Keep the callback registered for the registry's lifetime.
    pub fn forget(mut self) {
        self.detach = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.detach.is_some())
            .finish()
    }
}
