//! Type registry shared by the cache and its backends
//!
//! The registry replaces process-wide singletons: it is created once, handed
//! to the cache at construction and shared by `Arc` with every backend
//! assistant. It owns:
//!
//! - the TypeKey interner (one allocation per type name),
//! - the TypeKey → partition id mapping used by the disk layout,
//! - optional per-type [`RecordSchema`]s,
//! - the [`IdAllocator`] for record ids.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let registry = Arc::new(CacheRegistry::new());
//! let roads = registry.intern_type("roads", "osm-extract");
//! let partition = registry.partition_of(&roads);
//! registry.register_schema(&roads, schema);
//! ```

use geocache_core::{RecordSchema, TypeKey};
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::index::IdAllocator;

/// Explicitly owned registry of types, partitions, schemas and ids
#[derive(Debug)]
pub struct CacheRegistry {
    /// Interned keys, looked up by name through `Borrow<str>`
    types: RwLock<FxHashSet<TypeKey>>,
    /// Partition ids by type
    partitions: RwLock<FxHashMap<TypeKey, u32>>,
    /// Schemas by type
    schemas: RwLock<FxHashMap<TypeKey, Arc<RecordSchema>>>,
    next_partition: AtomicU32,
    ids: IdAllocator,
}

impl CacheRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        CacheRegistry {
            types: RwLock::new(FxHashSet::default()),
            partitions: RwLock::new(FxHashMap::default()),
            schemas: RwLock::new(FxHashMap::default()),
            next_partition: AtomicU32::new(0),
            ids: IdAllocator::new(),
        }
    }

    /// Intern the key for a `(category, source)` pair
    pub fn intern_type(&self, category: &str, source: &str) -> TypeKey {
        self.intern(&TypeKey::compose(category, source))
    }

    /// Intern a key by full name
    ///
    /// Every call with the same text returns a clone of the same allocation.
    pub fn intern(&self, name: &str) -> TypeKey {
        if let Some(key) = self.types.read().get(name) {
            return key.clone();
        }
        let mut types = self.types.write();
        if let Some(key) = types.get(name) {
            return key.clone();
        }
        let key = TypeKey::new(name);
        types.insert(key.clone());
        key
    }

    /// Look up an interned key without creating it
    pub fn lookup(&self, name: &str) -> Option<TypeKey> {
        self.types.read().get(name).cloned()
    }

    /// Partition id of a type, assigned on first use
    pub fn partition_of(&self, type_key: &TypeKey) -> u32 {
        if let Some(p) = self.partitions.read().get(type_key) {
            return *p;
        }
        *self
            .partitions
            .write()
            .entry(type_key.clone())
            .or_insert_with(|| self.next_partition.fetch_add(1, Ordering::Relaxed))
    }

    /// Partition id of a type if one was assigned
    pub fn existing_partition(&self, type_key: &TypeKey) -> Option<u32> {
        self.partitions.read().get(type_key).copied()
    }

    /// Register or replace a type's schema
    pub fn register_schema(&self, type_key: &TypeKey, schema: RecordSchema) {
        self.schemas
            .write()
            .insert(type_key.clone(), Arc::new(schema));
    }

    /// Schema of a type
    pub fn schema(&self, type_key: &TypeKey) -> Option<Arc<RecordSchema>> {
        self.schemas.read().get(type_key).cloned()
    }

    /// Forget a type's partition and schema
    ///
    /// The interned key stays valid; a later insert of the same type gets a
    /// fresh partition so it never collides with a partition being deleted.
    pub fn forget_type(&self, type_key: &TypeKey) -> Option<u32> {
        self.schemas.write().remove(type_key);
        self.partitions.write().remove(type_key)
    }

    /// Record id allocator
    pub fn ids(&self) -> &IdAllocator {
        &self.ids
    }

    /// Number of interned type names
    pub fn type_count(&self) -> usize {
        self.types.read().len()
    }
}

impl Default for CacheRegistry {
    fn default() -> Self {
        Self::new()
    }
}
