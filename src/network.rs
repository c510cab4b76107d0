//! Connectivity state.
//!
//! The platform adapter (browser online/offline events, a mobile
//! reachability API, a health probe) calls [`NetworkMonitor::set_connected`];
//! everything else reads or watches the flag.

use tokio::sync::watch;
use tracing::info;

use crate::observers::{Observers, Subscription};

pub struct NetworkMonitor {
    state: watch::Sender<bool>,
    listeners: Observers<bool>,
}

impl NetworkMonitor {
    #[must_use]
    pub fn new(connected: bool) -> Self {
        let (state, _) = watch::channel(connected);
        crate::metrics::set_connected(connected);
        Self {
            state,
            listeners: Observers::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.state.borrow()
    }

    /// Record a connectivity change. Repeating the current state is a no-op.
    pub fn set_connected(&self, connected: bool) {
        let changed = self.state.send_if_modified(|current| {
            if *current == connected {
                return false;
            }
            *current = connected;
            true
        });
        if !changed {
            return;
        }

        info!(connected, "Connectivity changed");
        crate::metrics::set_connected(connected);
        self.listeners.notify(&connected);
    }

    /// Call `callback` with the new state on every change.
    pub fn on_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.listeners.subscribe(move |connected: &bool| callback(*connected))
    }

    /// Receiver for async consumers (the sync loop).
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
