//! Record index and id allocation
//!
//! - `RecordIndex`: Maps TypeKey → ordered set of live RecordIds
//! - `IdAllocator`: Lock-free monotonic id counter
//!
//! An id appears in exactly one type's set, and only while its cache entry
//! exists. The index is the authority for "which ids belong to this type";
//! the entry map is the authority for "does this id exist".

use geocache_core::{RecordId, TypeKey};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic id source
///
/// Ids are strictly increasing and never reused. The sentinel
/// [`RecordId::FILTERED`] is never handed out.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    /// Allocator starting at id 1
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Allocator starting at a given id
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Mint one id
    #[inline]
    pub fn allocate(&self) -> RecordId {
        RecordId::new(self.next.fetch_add(1, Ordering::Relaxed))
    }

}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Secondary index: TypeKey → RecordIds
///
/// Enables "all records of this type" enumeration without scanning the entry
/// map. Types stay registered (possibly with an empty set) until
/// [`RecordIndex::remove_type`] is called.
#[derive(Debug, Default)]
pub struct RecordIndex {
    index: RwLock<FxHashMap<TypeKey, BTreeSet<RecordId>>>,
}

impl RecordIndex {
    /// Create a new empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type with no ids; no-op if already known
    pub fn add_type(&self, type_key: &TypeKey) {
        self.index.write().entry(type_key.clone()).or_default();
    }

    /// Whether the type is registered
    pub fn has_type(&self, type_key: &TypeKey) -> bool {
        self.index.read().contains_key(type_key)
    }

    /// Registered types
    pub fn types(&self) -> Vec<TypeKey> {
        self.index.read().keys().cloned().collect()
    }

    /// Ids of a type in ascending order; empty for unknown types
    pub fn ids_for_type(&self, type_key: &TypeKey) -> Vec<RecordId> {
        self.index
            .read()
            .get(type_key)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of ids of a type; zero for unknown types
    pub fn count_for_type(&self, type_key: &TypeKey) -> usize {
        self.index.read().get(type_key).map_or(0, BTreeSet::len)
    }

    /// Whether `id` belongs to `type_key`
    pub fn contains(&self, type_key: &TypeKey, id: RecordId) -> bool {
        self.index
            .read()
            .get(type_key)
            .is_some_and(|ids| ids.contains(&id))
    }

    /// Add ids to a type, registering the type if needed
    pub fn add_ids(&self, type_key: &TypeKey, ids: &[RecordId]) {
        let mut index = self.index.write();
        let set = index.entry(type_key.clone()).or_default();
        set.extend(ids.iter().copied().filter(|id| !id.is_filtered()));
    }

    /// Remove ids from a type, returning how many were members
    pub fn remove_ids(&self, type_key: &TypeKey, ids: &[RecordId]) -> usize {
        let mut index = self.index.write();
        match index.get_mut(type_key) {
            Some(set) => ids.iter().filter(|id| set.remove(id)).count(),
            None => 0,
        }
    }

    /// Drop a type and all its ids, returning the ids it held
    pub fn remove_type(&self, type_key: &TypeKey) -> Vec<RecordId> {
        self.index
            .write()
            .remove(type_key)
            .map(|ids| ids.into_iter().collect())
            .unwrap_or_default()
    }

    /// Every live id, grouped by type
    pub fn all_ids(&self) -> Vec<RecordId> {
        let index = self.index.read();
        let mut ids: Vec<RecordId> = index.values().flatten().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Total ids across all types
    pub fn total_count(&self) -> usize {
        self.index.read().values().map(BTreeSet::len).sum()
    }

    /// Check if the index has no types
    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    /// Number of registered types
    pub fn len(&self) -> usize {
        self.index.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn ids(raw: &[u64]) -> Vec<RecordId> {
        raw.iter().copied().map(RecordId::new).collect()
    }

    // ========================================
    // IdAllocator Tests
    // ========================================

    #[test]
    fn test_allocator_is_monotonic() {
        let alloc = IdAllocator::new();
        let a = alloc.allocate();
        let b = alloc.allocate();
        assert!(a < b);
        assert_eq!(alloc.allocate(), RecordId::new(b.as_u64() + 1));
    }

    #[test]
    fn test_allocator_starting_point() {
        let alloc = IdAllocator::starting_at(10);
        assert_eq!(alloc.allocate(), RecordId::new(10));
        assert_eq!(alloc.allocate(), RecordId::new(11));
    }

    #[test]
    fn test_allocator_concurrent_ids_unique() {
        let alloc = Arc::new(IdAllocator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let a = Arc::clone(&alloc);
                thread::spawn(move || (0..1000).map(|_| a.allocate()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<RecordId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 4000);
    }

    // ========================================
    // RecordIndex Tests
    // ========================================

    #[test]
    fn test_add_and_enumerate() {
        let index = RecordIndex::new();
        let roads = TypeKey::new("roads/a");
        index.add_ids(&roads, &ids(&[3, 1, 2]));

        assert_eq!(index.ids_for_type(&roads), ids(&[1, 2, 3]));
        assert_eq!(index.count_for_type(&roads), 3);
        assert!(index.contains(&roads, RecordId::new(2)));
        assert!(!index.contains(&roads, RecordId::new(9)));
    }

    #[test]
    fn test_unknown_type_is_empty_not_error() {
        let index = RecordIndex::new();
        let unknown = TypeKey::new("nope");
        assert!(index.ids_for_type(&unknown).is_empty());
        assert_eq!(index.count_for_type(&unknown), 0);
        assert_eq!(index.remove_ids(&unknown, &ids(&[1])), 0);
        assert!(index.remove_type(&unknown).is_empty());
    }

    #[test]
    fn test_add_type_without_ids() {
        let index = RecordIndex::new();
        let t = TypeKey::new("empty");
        index.add_type(&t);
        assert!(index.has_type(&t));
        assert_eq!(index.count_for_type(&t), 0);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_sentinel_never_indexed() {
        let index = RecordIndex::new();
        let t = TypeKey::new("t");
        index.add_ids(&t, &[RecordId::new(1), RecordId::FILTERED]);
        assert_eq!(index.ids_for_type(&t), ids(&[1]));
    }

    #[test]
    fn test_remove_ids_counts_members_only() {
        let index = RecordIndex::new();
        let t = TypeKey::new("t");
        index.add_ids(&t, &ids(&[1, 2, 3]));
        assert_eq!(index.remove_ids(&t, &ids(&[2, 7])), 1);
        assert_eq!(index.ids_for_type(&t), ids(&[1, 3]));
        // Type stays registered even when emptied
        index.remove_ids(&t, &ids(&[1, 3]));
        assert!(index.has_type(&t));
    }

    #[test]
    fn test_remove_type_and_all_ids() {
        let index = RecordIndex::new();
        let a = TypeKey::new("a");
        let b = TypeKey::new("b");
        index.add_ids(&a, &ids(&[1, 4]));
        index.add_ids(&b, &ids(&[2, 3]));

        assert_eq!(index.all_ids(), ids(&[1, 2, 3, 4]));
        assert_eq!(index.total_count(), 4);

        assert_eq!(index.remove_type(&a), ids(&[1, 4]));
        assert!(!index.has_type(&a));
        assert_eq!(index.all_ids(), ids(&[2, 3]));
    }
}
