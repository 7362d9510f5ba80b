//! Per-type load filters
//!
//! A filter decides at insert time whether a decoded record enters the
//! cache. Rejected records get [`RecordId::FILTERED`] in the returned id
//! list and never reach the entry map or the index.
//!
//! [`RecordId::FILTERED`]: geocache_core::RecordId::FILTERED

use geocache_core::{FeatureRecord, TimeSpan, TypeKey};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Insert-time record predicate
pub trait LoadFilter: Send + Sync {
    /// Whether the record should be cached
    fn accept(&self, record: &FeatureRecord) -> bool;
}

impl<F> LoadFilter for F
where
    F: Fn(&FeatureRecord) -> bool + Send + Sync,
{
    fn accept(&self, record: &FeatureRecord) -> bool {
        self(record)
    }
}

/// Accepts records whose time span intersects a window
#[derive(Debug, Clone, Copy)]
pub struct TimeWindowFilter {
    window: TimeSpan,
}

impl TimeWindowFilter {
    /// Filter keeping records that overlap `window`
    pub fn new(window: TimeSpan) -> Self {
        Self { window }
    }
}

impl LoadFilter for TimeWindowFilter {
    fn accept(&self, record: &FeatureRecord) -> bool {
        record.time_span.intersects(&self.window)
    }
}

/// Filters by type
#[derive(Default)]
pub struct FilterSet {
    filters: RwLock<FxHashMap<TypeKey, Arc<dyn LoadFilter>>>,
}

impl FilterSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the filter of a type
    pub fn set(&self, type_key: TypeKey, filter: Arc<dyn LoadFilter>) {
        self.filters.write().insert(type_key, filter);
    }

    /// Remove the filter of a type
    pub fn clear(&self, type_key: &TypeKey) -> bool {
        self.filters.write().remove(type_key).is_some()
    }

    /// Filter of a type
    pub fn get(&self, type_key: &TypeKey) -> Option<Arc<dyn LoadFilter>> {
        self.filters.read().get(type_key).cloned()
    }
}
