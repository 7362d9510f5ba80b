//! Add/remove notifications
//!
//! Rendering and UI layers register a [`CacheListener`] to learn which ids
//! appeared or disappeared. Notifications are delivered synchronously on the
//! thread that performed the insert or removal, after the change is visible.

use geocache_core::{RecordId, TypeKey};
use parking_lot::RwLock;
use std::sync::Arc;

/// Receiver of cache change notifications
pub trait CacheListener: Send + Sync {
    /// Records were inserted (filtered-out records are not reported)
    fn records_added(&self, type_key: &TypeKey, ids: &[RecordId]);

    /// Records were removed
    fn records_removed(&self, type_key: &TypeKey, ids: &[RecordId]);

    /// A whole type was removed; called after `records_removed`
    fn type_removed(&self, _type_key: &TypeKey) {}
}

/// Registered listeners
#[derive(Default)]
pub struct ListenerSet {
    listeners: RwLock<Vec<Arc<dyn CacheListener>>>,
}

impl ListenerSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener
    pub fn add(&self, listener: Arc<dyn CacheListener>) {
        self.listeners.write().push(listener);
    }

    /// Unregister a listener by identity, returning whether it was present
    pub fn remove(&self, listener: &Arc<dyn CacheListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Check if no listener is registered
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    // Listeners are called on a snapshot so one may unregister itself
    fn snapshot(&self) -> Vec<Arc<dyn CacheListener>> {
        self.listeners.read().clone()
    }

    pub(crate) fn notify_added(&self, type_key: &TypeKey, ids: &[RecordId]) {
        if ids.is_empty() {
            return;
        }
        for l in self.snapshot() {
            l.records_added(type_key, ids);
        }
    }

    pub(crate) fn notify_removed(&self, type_key: &TypeKey, ids: &[RecordId]) {
        if ids.is_empty() {
            return;
        }
        for l in self.snapshot() {
            l.records_removed(type_key, ids);
        }
    }

    pub(crate) fn notify_type_removed(&self, type_key: &TypeKey) {
        for l in self.snapshot() {
            l.type_removed(type_key);
        }
    }
}
