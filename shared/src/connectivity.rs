//! Connectivity Monitor.
//!
//! The platform shell pushes reachability readings in through
//! [`ConnectivityMonitor::update`]; consumers either register callbacks or hold
//! a `watch` receiver. Only real transitions are delivered.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectivityState {
    /// Associated with a network (link layer).
    pub connected: bool,
    /// That network actually routes to the internet.
    pub internet_reachable: bool,
}

impl ConnectivityState {
    pub const ONLINE: Self = Self {
        connected: true,
        internet_reachable: true,
    };
    pub const OFFLINE: Self = Self {
        connected: false,
        internet_reachable: false,
    };

    pub const fn new(connected: bool, internet_reachable: bool) -> Self {
        Self {
            connected,
            internet_reachable,
        }
    }

    /// Whether a send attempt is worth making right now.
    pub const fn is_sync_worthy(self) -> bool {
        self.connected && self.internet_reachable
    }
}

type Callback = Arc<dyn Fn(ConnectivityState) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    callbacks: BTreeMap<u64, Callback>,
}

struct MonitorInner {
    state: watch::Sender<ConnectivityState>,
    listeners: Mutex<Listeners>,
}

impl MonitorInner {
    fn listeners(&self) -> std::sync::MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<MonitorInner>,
}

impl ConnectivityMonitor {
    pub fn new(initial: ConnectivityState) -> Self {
        let (state, _) = watch::channel(initial);
        Self {
            inner: Arc::new(MonitorInner {
                state,
                listeners: Mutex::new(Listeners::default()),
            }),
        }
    }

    pub fn current(&self) -> ConnectivityState {
        *self.inner.state.borrow()
    }

    /// Record a reading from the platform. Returns true on a transition.
    pub fn update(&self, next: ConnectivityState) -> bool {
        let changed = self.inner.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
        if !changed {
            return false;
        }

        info!(
            connected = next.connected,
            internet_reachable = next.internet_reachable,
            "connectivity changed"
        );
        // Callbacks run outside the lock so they may subscribe or unsubscribe.
        let callbacks: Vec<Callback> = self.inner.listeners().callbacks.values().cloned().collect();
        for callback in callbacks {
            callback(next);
        }
        true
    }

    /// Register `callback`; it fires immediately with the current state and
    /// then on every transition until the returned handle is released.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(ConnectivityState) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        let id = {
            let mut listeners = self.inner.listeners();
            listeners.next_id += 1;
            let id = listeners.next_id;
            listeners.callbacks.insert(id, Arc::clone(&callback));
            id
        };
        debug!(subscription = id, "connectivity subscriber added");
        callback(self.current());
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Receiver for async consumers such as the sync loop.
    pub fn watch(&self) -> watch::Receiver<ConnectivityState> {
        self.inner.state.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.listeners().callbacks.len()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(ConnectivityState::OFFLINE)
    }
}

/// Unsubscribe handle. Dropping it releases the callback.
#[must_use = "dropping the subscription immediately unsubscribes"]
pub struct Subscription {
    id: u64,
    inner: Weak<MonitorInner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.listeners().callbacks.remove(&self.id);
            debug!(subscription = self.id, "connectivity subscriber released");
        }
    }
}
