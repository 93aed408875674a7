//! Change notification for cache subscribers.
//!
//! A listener registered at key `K` fires when `K` or any key below it
//! changes. Every subscription remembers the last store version it was told
//! about, so a batch touching many keys reaches each listener once.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use metrics::gauge;
use tracing::trace;

use super::key::ResourceKey;
use super::lock::{read, write};

const SOURCE: &str = "sync::broker";
const METRIC_SUBSCRIPTIONS: &str = "almanac_sync_subscriptions";

/// Why a notification was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeCause {
    Updated,
    Invalidated,
    Restored,
    Evicted,
}

impl ChangeCause {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeCause::Updated => "updated",
            ChangeCause::Invalidated => "invalidated",
            ChangeCause::Restored => "restored",
            ChangeCause::Evicted => "evicted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Key the listener was registered at.
    pub subscribed: ResourceKey,
    /// Key (or invalidated prefix) that triggered the notification.
    pub changed: ResourceKey,
    pub version: u64,
    pub cause: ChangeCause,
}

pub type Listener = Arc<dyn Fn(&Notification) + Send + Sync>;

struct Registration {
    key: ResourceKey,
    listener: Listener,
    last_version: AtomicU64,
    active: AtomicBool,
}

impl Registration {
    fn deliver(&self, changed: &ResourceKey, version: u64, cause: ChangeCause) -> bool {
        if !self.active.load(Ordering::Acquire) {
            return false;
        }
        if self.last_version.fetch_max(version, Ordering::AcqRel) >= version {
            return false;
        }
        let notification = Notification {
            subscribed: self.key.clone(),
            changed: changed.clone(),
            version,
            cause,
        };
        (self.listener)(&notification);
        true
    }
}

/// Registry of cache listeners.
pub struct SubscriptionBroker {
    registrations: RwLock<BTreeMap<u64, Arc<Registration>>>,
    next_id: AtomicU64,
}

impl SubscriptionBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registrations: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Register `listener` for changes at or below `key`.
    ///
    /// The registration lives until the returned handle is dropped or
    /// [`Subscription::unsubscribe`] is called.
    pub fn subscribe<F>(self: &Arc<Self>, key: ResourceKey, listener: F) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let registration = Arc::new(Registration {
            key: key.clone(),
            listener: Arc::new(listener),
            last_version: AtomicU64::new(0),
            active: AtomicBool::new(true),
        });

        let count = {
            let mut registrations = write(&self.registrations, SOURCE, "subscribe");
            registrations.insert(id, registration);
            registrations.len()
        };
        gauge!(METRIC_SUBSCRIPTIONS).set(count as f64);
        trace!(subscription = id, key = %key, "Subscription registered");

        Subscription {
            id,
            key,
            broker: Arc::downgrade(self),
        }
    }

    fn remove(&self, id: u64) {
        let count = {
            let mut registrations = write(&self.registrations, SOURCE, "unsubscribe");
            if let Some(registration) = registrations.remove(&id) {
                registration.active.store(false, Ordering::Release);
            }
            registrations.len()
        };
        gauge!(METRIC_SUBSCRIPTIONS).set(count as f64);
        trace!(subscription = id, "Subscription removed");
    }

    /// Notify every listener registered at `changed` or one of its ancestors.
    ///
    /// Returns the number of listeners invoked.
    pub fn notify(&self, changed: &ResourceKey, version: u64, cause: ChangeCause) -> usize {
        let targets = self.matching(|key| key.is_prefix_of(changed));
        targets
            .iter()
            .filter(|registration| registration.deliver(changed, version, cause))
            .count()
    }

    /// Notify once for a change touching several keys.
    ///
    /// A listener fires if it sits at or above any key in `changed`, or at or
    /// below any key in `prefixes`.
    pub fn notify_batch(
        &self,
        changed: &[ResourceKey],
        prefixes: &[ResourceKey],
        version: u64,
        cause: ChangeCause,
    ) -> usize {
        let mut delivered = 0;
        for registration in self.snapshot() {
            let trigger = changed
                .iter()
                .find(|key| registration.key.is_prefix_of(key))
                .or_else(|| {
                    prefixes
                        .iter()
                        .find(|prefix| prefix.is_prefix_of(&registration.key))
                });
            if let Some(trigger) = trigger
                && registration.deliver(trigger, version, cause)
            {
                delivered += 1;
            }
        }
        delivered
    }

    /// Notify every listener, e.g. after the whole cache was invalidated.
    pub fn notify_all(&self, version: u64, cause: ChangeCause) -> usize {
        self.snapshot()
            .iter()
            .filter(|registration| registration.deliver(&registration.key, version, cause))
            .count()
    }

    /// True when a listener is registered at `key` or one of its ancestors.
    pub fn has_observers(&self, key: &ResourceKey) -> bool {
        read(&self.registrations, SOURCE, "has_observers")
            .values()
            .any(|registration| registration.key.is_prefix_of(key))
    }

    pub fn len(&self) -> usize {
        read(&self.registrations, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn matching(&self, predicate: impl Fn(&ResourceKey) -> bool) -> Vec<Arc<Registration>> {
        read(&self.registrations, SOURCE, "matching")
            .values()
            .filter(|registration| predicate(&registration.key))
            .cloned()
            .collect()
    }

    // Listeners run without the registry lock so they can subscribe or
    // unsubscribe from inside a callback.
    fn snapshot(&self) -> Vec<Arc<Registration>> {
        self.matching(|_| true)
    }
}

impl fmt::Debug for SubscriptionBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionBroker")
            .field("subscriptions", &self.len())
            .finish()
    }
}

/// Handle of a registered listener.
#[must_use = "dropping a Subscription unregisters its listener"]
pub struct Subscription {
    id: u64,
    key: ResourceKey,
    broker: Weak<SubscriptionBroker>,
}

impl Subscription {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(broker) = self.broker.upgrade() {
            broker.remove(self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("key", &self.key)
            .finish()
    }
}
