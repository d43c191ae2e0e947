use crate::subscription::{ChangeReceiver, FeatureChange};
use crate::types::FeatureValue;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tokio::sync::{broadcast, watch};

const CHANGE_CAPACITY: usize = 100;

/// Callback invoked with each value published for a feature
pub type Listener = Arc<dyn Fn(&FeatureValue) + Send + Sync>;

/// Handle for removing a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Last known value of a feature
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue {
    pub value: FeatureValue,
    pub updated_at: Instant,
}

/// Routes published values to listeners and keeps the value cache
///
/// [`Router::publish`] is the only path that writes the cache. Notifications,
/// poll results and derived capabilities all go through it.
pub struct Router {
    listeners: RwLock<HashMap<String, Vec<(ListenerId, Listener)>>>,
    cache: RwLock<HashMap<String, CachedValue>>,
    next_listener: AtomicU64,
    stale_tx: watch::Sender<bool>,
    changes_tx: broadcast::Sender<FeatureChange>,
}

impl Router {
    pub fn new() -> Self {
        let (changes_tx, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            listeners: RwLock::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
            next_listener: AtomicU64::new(0),
            stale_tx: watch::channel(false).0,
            changes_tx,
        }
    }

    /// Register a listener for a feature
    pub fn subscribe(&self, feature: &str, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        write(&self.listeners)
            .entry(feature.to_string())
            .or_default()
            .push((id, listener));
        id
    }

    /// Remove a listener; returns false if it was not registered
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = write(&self.listeners);
        let mut removed = false;
        listeners.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|(entry, _)| *entry != id);
            removed |= entries.len() != before;
            !entries.is_empty()
        });
        removed
    }

    /// Record a value and deliver it to the feature's listeners
    ///
    /// Listeners run in registration order. A panicking listener is logged
    /// and skipped. Repeated values are delivered every time.
    pub fn publish(&self, feature: &str, value: FeatureValue) {
        write(&self.cache).insert(
            feature.to_string(),
            CachedValue {
                value: value.clone(),
                updated_at: Instant::now(),
            },
        );

        let listeners: Vec<Listener> = read(&self.listeners)
            .get(feature)
            .map(|entries| entries.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&value))).is_err() {
                tracing::error!("Listener for {} panicked", feature);
            }
        }

        let _ = self.changes_tx.send(FeatureChange {
            feature: feature.to_string(),
            value,
        });
    }

    /// Last known value, `None` if never observed
    pub fn current_value(&self, feature: &str) -> Option<FeatureValue> {
        read(&self.cache).get(feature).map(|c| c.value.clone())
    }

    /// Last known value with the time it was recorded
    pub fn cached(&self, feature: &str) -> Option<CachedValue> {
        read(&self.cache).get(feature).cloned()
    }

    /// Features with at least one listener
    pub fn subscribed_features(&self) -> Vec<String> {
        let mut features: Vec<_> = read(&self.listeners).keys().cloned().collect();
        features.sort();
        features
    }

    /// Receive every published change
    pub fn changes(&self) -> ChangeReceiver {
        ChangeReceiver::new(self.changes_tx.subscribe())
    }

    /// Flag cached values as possibly out of date
    pub fn set_stale(&self, stale: bool) {
        let changed = self.stale_tx.send_if_modified(|current| {
            let changed = *current != stale;
            *current = stale;
            changed
        });
        if changed {
            tracing::debug!("Cached values stale: {}", stale);
        }
    }

    pub fn is_stale(&self) -> bool {
        *self.stale_tx.borrow()
    }

    /// Observe the stale flag as it is raised and cleared
    pub fn watch_stale(&self) -> watch::Receiver<bool> {
        self.stale_tx.subscribe()
    }

    /// Drop all cached values
    pub fn clear(&self) {
        write(&self.cache).clear();
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
