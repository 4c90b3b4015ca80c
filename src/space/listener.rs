use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use parking_lot::RwLock;

use crate::space::entry::{deadline_after, now_millis};

/// Callback fired synchronously whenever a value is deposited under a watched
/// key.
///
/// Listeners observe the value before any taker can see it and never remove
/// it from the queue.
pub trait SpaceListener<K, V>: Send + Sync {
    fn notify(&self, key: &K, value: &V);
}

impl<K, V, F> SpaceListener<K, V> for F
where
    F: Fn(&K, &V) + Send + Sync,
{
    fn notify(&self, key: &K, value: &V) {
        self(key, value)
    }
}

struct Registration<K, V> {
    listener: Arc<dyn SpaceListener<K, V>>,
    /// Absolute deadline after which the registration is dropped.
    expires_at: Option<u64>,
}

impl<K, V> Registration<K, V> {
    fn is_expired_at(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

fn same_listener<K, V>(a: &Arc<dyn SpaceListener<K, V>>, b: &Arc<dyn SpaceListener<K, V>>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Per-key listener table.
pub(crate) struct Listeners<K, V> {
    table: RwLock<HashMap<K, Vec<Registration<K, V>>>>,
}

impl<K: Eq + Hash + Clone, V> Listeners<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn add(&self, key: K, listener: Arc<dyn SpaceListener<K, V>>, window: Option<Duration>) {
        let registration = Registration {
            listener,
            expires_at: window.map(deadline_after),
        };
        self.table.write().entry(key).or_default().push(registration);
    }

    pub(crate) fn remove(&self, key: &K, listener: &Arc<dyn SpaceListener<K, V>>) -> bool {
        let mut table = self.table.write();
        let Some(registrations) = table.get_mut(key) else {
            return false;
        };
        let before = registrations.len();
        registrations.retain(|r| !same_listener(&r.listener, listener));
        let removed = registrations.len() != before;
        if registrations.is_empty() {
            table.remove(key);
        }
        removed
    }

    /// Listeners currently registered for `key`, expired registrations
    /// excluded. Returned as owned handles so callers can fire them without
    /// holding the table lock.
    pub(crate) fn active(&self, key: &K) -> Vec<Arc<dyn SpaceListener<K, V>>> {
        let now = now_millis();
        let table = self.table.read();
        table
            .get(key)
            .map(|registrations| {
                registrations
                    .iter()
                    .filter(|r| !r.is_expired_at(now))
                    .map(|r| Arc::clone(&r.listener))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drops expired registrations. Returns how many were dropped.
    pub(crate) fn sweep(&self) -> usize {
        let now = now_millis();
        let mut table = self.table.write();
        let mut dropped = 0;
        table.retain(|_, registrations| {
            let before = registrations.len();
            registrations.retain(|r| !r.is_expired_at(now));
            dropped += before - registrations.len();
            !registrations.is_empty()
        });
        dropped
    }
}
