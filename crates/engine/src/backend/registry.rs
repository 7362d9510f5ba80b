//! Registry assistant
//!
//! Delegates payload storage to an external keyed [`ObjectRegistry`]. Each
//! record becomes one object of the class named after its type key and
//! partition (see [`class_name`]); each payload part maps to one typed
//! property through a [`PropertyAccessor`]:
//!
//! | part      | property    | value                         |
//! |-----------|-------------|-------------------------------|
//! | origin id | `origin_id` | `Int`                         |
//! | metadata  | `metadata`  | `List` of metadata values     |
//! | geometry  | `geometry`  | `Blob` (MessagePack geometry) |
//!
//! Parts are stored as-is; the session cipher only applies to the disk
//! store.

use dashmap::DashMap;
use geocache_core::{Error, Geometry, MetadataValue, PartSet, Payload, PayloadPart, RecordId, Result, TypeKey};
use geocache_storage::{CacheEntry, Presence, RegistryRef, StoreRef};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    fan_out_retrieve, submit_or_run, BackendAssistant, BackendContext, DirectAccessRetriever,
    GroupFetcher, RetrieveRequest, RetrieveUpdate, Retrieved,
};
use crate::background::TaskPriority;

// ============================================================================
// External registry contract
// ============================================================================

/// Typed property value
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    /// 64-bit integer
    Int(i64),
    /// Ordered list of metadata values
    List(Vec<MetadataValue>),
    /// Opaque bytes
    Blob(Vec<u8>),
}

/// Properties of one object by name
pub type PropertyMap = BTreeMap<String, PropertyValue>;

/// External keyed object store
///
/// Objects are grouped in classes and addressed by the 64-bit id the
/// registry assigns at insert.
pub trait ObjectRegistry: Send + Sync {
    /// Insert objects of one class, returning their ids in input order
    fn insert_objects(&self, class: &str, objects: Vec<PropertyMap>) -> Result<Vec<u64>>;

    /// Fetch the named properties of several objects
    ///
    /// The result matches `ids` index by index; unknown ids yield `None`.
    fn query_properties(&self, ids: &[u64], properties: &[&str]) -> Result<Vec<Option<PropertyMap>>>;

    /// Delete objects, returning how many existed
    fn delete_objects(&self, ids: &[u64]) -> Result<usize>;

    /// Delete every object of a class, returning how many existed
    fn delete_class(&self, class: &str) -> Result<usize>;
}

// ============================================================================
// Property accessors
// ============================================================================

/// Maps one payload part to one registry property
pub trait PropertyAccessor: Send + Sync {
    /// Property name
    fn property(&self) -> &'static str;

    /// Part this accessor stores
    fn part(&self) -> PayloadPart;

    /// Property value for a payload; `None` if the part is null
    fn encode(&self, payload: &Payload) -> Result<Option<PropertyValue>>;

    /// Write a property value back into a payload
    fn decode(&self, value: PropertyValue, into: &mut Payload) -> Result<()>;
}

fn wrong_kind(property: &str, expected: &str) -> Error {
    Error::RegistryError(format!("property '{}' is not {}", property, expected))
}

/// `origin_id` as `Int`
#[derive(Debug, Clone, Copy, Default)]
pub struct OriginIdAccessor;

impl PropertyAccessor for OriginIdAccessor {
    fn property(&self) -> &'static str {
        "origin_id"
    }

    fn part(&self) -> PayloadPart {
        PayloadPart::OriginId
    }

    fn encode(&self, payload: &Payload) -> Result<Option<PropertyValue>> {
        // Bit-preserving: ids above i64::MAX come back unchanged
        Ok(payload.origin_id.map(|id| PropertyValue::Int(id as i64)))
    }

    fn decode(&self, value: PropertyValue, into: &mut Payload) -> Result<()> {
        match value {
            PropertyValue::Int(v) => {
                into.origin_id = Some(v as u64);
                Ok(())
            }
            _ => Err(wrong_kind(self.property(), "an Int")),
        }
    }
}

/// `metadata` as `List`
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataAccessor;

impl PropertyAccessor for MetadataAccessor {
    fn property(&self) -> &'static str {
        "metadata"
    }

    fn part(&self) -> PayloadPart {
        PayloadPart::Metadata
    }

    fn encode(&self, payload: &Payload) -> Result<Option<PropertyValue>> {
        Ok(payload
            .metadata
            .as_ref()
            .map(|m| PropertyValue::List(m.to_vec())))
    }

    fn decode(&self, value: PropertyValue, into: &mut Payload) -> Result<()> {
        match value {
            PropertyValue::List(values) => {
                into.metadata = Some(Arc::from(values));
                Ok(())
            }
            _ => Err(wrong_kind(self.property(), "a List")),
        }
    }
}

/// `geometry` as a MessagePack `Blob`
#[derive(Debug, Clone, Copy, Default)]
pub struct GeometryAccessor;

impl PropertyAccessor for GeometryAccessor {
    fn property(&self) -> &'static str {
        "geometry"
    }

    fn part(&self) -> PayloadPart {
        PayloadPart::Geometry
    }

    fn encode(&self, payload: &Payload) -> Result<Option<PropertyValue>> {
        match &payload.geometry {
            Some(g) => {
                let bytes = rmp_serde::to_vec(&**g)
                    .map_err(|e| Error::SerializationError(e.to_string()))?;
                Ok(Some(PropertyValue::Blob(bytes)))
            }
            None => Ok(None),
        }
    }

    fn decode(&self, value: PropertyValue, into: &mut Payload) -> Result<()> {
        match value {
            PropertyValue::Blob(bytes) => {
                let geometry: Geometry = rmp_serde::from_slice(&bytes)
                    .map_err(|e| Error::SerializationError(e.to_string()))?;
                into.geometry = Some(Arc::new(geometry));
                Ok(())
            }
            _ => Err(wrong_kind(self.property(), "a Blob")),
        }
    }
}

/// The three standard accessors
pub fn default_accessors() -> Vec<Box<dyn PropertyAccessor>> {
    vec![
        Box::new(OriginIdAccessor),
        Box::new(MetadataAccessor),
        Box::new(GeometryAccessor),
    ]
}

// ============================================================================
// In-process registry
// ============================================================================

#[derive(Debug, Clone)]
struct StoredObject {
    class: String,
    properties: PropertyMap,
}

/// [`ObjectRegistry`] kept in process memory
///
/// Ids start at 1 and are handed out in insert order, so the objects of one
/// insert call have consecutive ids.
#[derive(Debug)]
pub struct InMemoryRegistry {
    objects: DashMap<u64, StoredObject>,
    next_id: AtomicU64,
    offline: AtomicBool,
}

impl InMemoryRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
            next_id: AtomicU64::new(1),
            offline: AtomicBool::new(false),
        }
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Check if no object is stored
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Number of objects of one class
    pub fn class_len(&self, class: &str) -> usize {
        self.objects.iter().filter(|o| o.class == class).count()
    }

    /// Make every call fail until switched back
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::Acquire) {
            return Err(Error::RegistryError("registry offline".to_string()));
        }
        Ok(())
    }
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectRegistry for InMemoryRegistry {
    fn insert_objects(&self, class: &str, objects: Vec<PropertyMap>) -> Result<Vec<u64>> {
        self.check_online()?;
        let first = self
            .next_id
            .fetch_add(objects.len() as u64, Ordering::Relaxed);
        let mut ids = Vec::with_capacity(objects.len());
        for (offset, properties) in objects.into_iter().enumerate() {
            let id = first + offset as u64;
            self.objects.insert(
                id,
                StoredObject {
                    class: class.to_string(),
                    properties,
                },
            );
            ids.push(id);
        }
        Ok(ids)
    }

    fn query_properties(&self, ids: &[u64], properties: &[&str]) -> Result<Vec<Option<PropertyMap>>> {
        self.check_online()?;
        Ok(ids
            .iter()
            .map(|id| {
                self.objects.get(id).map(|o| {
                    o.properties
                        .iter()
                        .filter(|(name, _)| properties.contains(&name.as_str()))
                        .map(|(name, value)| (name.clone(), value.clone()))
                        .collect()
                })
            })
            .collect())
    }

    fn delete_objects(&self, ids: &[u64]) -> Result<usize> {
        self.check_online()?;
        Ok(ids
            .iter()
            .filter(|id| self.objects.remove(id).is_some())
            .count())
    }

    fn delete_class(&self, class: &str) -> Result<usize> {
        self.check_online()?;
        let before = self.objects.len();
        self.objects.retain(|_, o| o.class != class);
        Ok(before.saturating_sub(self.objects.len()))
    }
}

// ============================================================================
// Assistant
// ============================================================================

/// Registry handle plus the accessors of every part
pub struct RegistryStore {
    registry: Arc<dyn ObjectRegistry>,
    accessors: Vec<Box<dyn PropertyAccessor>>,
}

impl RegistryStore {
    /// Store with the standard accessors
    pub fn new(registry: Arc<dyn ObjectRegistry>) -> Self {
        Self::with_accessors(registry, default_accessors())
    }

    /// Store with custom accessors (at most one per part)
    pub fn with_accessors(registry: Arc<dyn ObjectRegistry>, accessors: Vec<Box<dyn PropertyAccessor>>) -> Self {
        Self {
            registry,
            accessors,
        }
    }

    /// The external registry
    pub fn registry(&self) -> &Arc<dyn ObjectRegistry> {
        &self.registry
    }

    fn accessor(&self, part: PayloadPart) -> Option<&dyn PropertyAccessor> {
        self.accessors
            .iter()
            .find(|a| a.part() == part)
            .map(|a| a.as_ref())
    }

    /// Properties of one payload and the parts they cover
    pub fn encode(&self, payload: &Payload) -> Result<(PropertyMap, Presence)> {
        let mut properties = PropertyMap::new();
        let mut parts = PartSet::NONE;
        for accessor in &self.accessors {
            if let Some(value) = accessor.encode(payload)? {
                properties.insert(accessor.property().to_string(), value);
                parts = parts.with(accessor.part());
            }
        }
        Ok((properties, Presence::new(parts)))
    }

    /// Rebuild the `wanted` parts of a payload from fetched properties
    pub fn decode(&self, mut properties: PropertyMap, wanted: PartSet) -> Result<Payload> {
        let mut payload = Payload::empty();
        for part in wanted.iter() {
            let Some(accessor) = self.accessor(part) else {
                continue;
            };
            if let Some(value) = properties.remove(accessor.property()) {
                accessor.decode(value, &mut payload)?;
            }
        }
        Ok(payload)
    }

    fn property_names(&self, parts: PartSet) -> Vec<&'static str> {
        self.accessors
            .iter()
            .filter(|a| parts.contains(a.part()))
            .map(|a| a.property())
            .collect()
    }

    /// Fetch the `wanted` parts of several objects in one query
    pub fn fetch(&self, ids: &[u64], wanted: &[PartSet]) -> Vec<Result<Payload>> {
        let union = wanted.iter().fold(PartSet::NONE, |acc, w| acc.union(*w));
        let names = self.property_names(union);
        let rows = match self.registry.query_properties(ids, &names) {
            Ok(rows) if rows.len() == ids.len() => rows,
            Ok(rows) => {
                let msg = format!("registry answered {} of {} objects", rows.len(), ids.len());
                return ids.iter().map(|_| Err(Error::RegistryError(msg.clone()))).collect();
            }
            Err(e) => {
                let msg = e.to_string();
                return ids.iter().map(|_| Err(Error::RegistryError(msg.clone()))).collect();
            }
        };

        rows.into_iter()
            .zip(ids.iter().zip(wanted))
            .map(|(row, (id, w))| match row {
                Some(properties) => self.decode(properties, *w),
                None => Err(Error::RegistryError(format!("object {} not found", id))),
            })
            .collect()
    }
}

impl GroupFetcher for RegistryStore {
    fn fetch_group(&self, group: &[RetrieveRequest], wanted: &[PartSet]) -> Vec<Result<Payload>> {
        let mut out: Vec<Option<Result<Payload>>> = group.iter().map(|_| None).collect();
        let mut ids = Vec::with_capacity(group.len());
        let mut positions = Vec::with_capacity(group.len());
        let mut parts = Vec::with_capacity(group.len());
        for (idx, request) in group.iter().enumerate() {
            match request.store_ref.as_registry() {
                Some(r) => {
                    ids.push(r.external_id());
                    positions.push(idx);
                    parts.push(wanted[idx]);
                }
                None => out[idx] = Some(Err(Error::invalid_argument("disk reference in registry store"))),
            }
        }
        if !ids.is_empty() {
            for (idx, result) in positions.into_iter().zip(self.fetch(&ids, &parts)) {
                out[idx] = Some(result);
            }
        }
        out.into_iter()
            .map(|r| r.unwrap_or_else(|| Err(Error::RegistryError("object not fetched".to_string()))))
            .collect()
    }
}

/// Registry class holding the objects of one type partition
///
/// A removed type comes back in a fresh partition, so its late class
/// deletion never touches objects written after the removal.
pub fn class_name(type_key: &TypeKey, partition: u32) -> String {
    format!("{}#{}", type_key.as_str(), partition)
}

/// Spill one batch into the registry and attach the references
///
/// Objects written for entries removed in the meantime are deleted again.
pub(crate) fn spill_batch(
    store: &RegistryStore,
    type_key: &TypeKey,
    class: &str,
    batch: Vec<(RecordId, Arc<CacheEntry>)>,
) {
    let mut objects = Vec::with_capacity(batch.len());
    let mut pending = Vec::with_capacity(batch.len());
    for (id, entry) in batch {
        if entry.is_retired() {
            continue;
        }
        let Some(payload) = entry.payload() else {
            continue;
        };
        match store.encode(&payload) {
            Ok((properties, presence)) => {
                objects.push(properties);
                pending.push((entry, presence));
            }
            Err(e) => {
                warn!(target: "geocache::registry", id = %id, error = %e, "Failed to encode record, it stays resident")
            }
        }
    }
    if objects.is_empty() {
        return;
    }

    let count = objects.len();
    let external_ids = match store.registry.insert_objects(class, objects) {
        Ok(ids) if ids.len() == count => ids,
        Ok(ids) => {
            // Ids cannot be matched to records; release what was written
            warn!(target: "geocache::registry", type_key = %type_key, expected = count, got = ids.len(), "Registry returned a short id list");
            if let Err(e) = store.registry.delete_objects(&ids) {
                warn!(target: "geocache::registry", error = %e, "Failed to delete unmatched objects");
            }
            return;
        }
        Err(e) => {
            warn!(target: "geocache::registry", type_key = %type_key, records = count, error = %e, "Registry insert failed, records stay resident");
            return;
        }
    };

    let mut orphans = Vec::new();
    for ((entry, presence), external_id) in pending.into_iter().zip(external_ids) {
        if !entry.attach_store_ref(StoreRef::Registry(RegistryRef::new(external_id, presence))) {
            orphans.push(external_id);
        }
    }
    debug!(target: "geocache::registry", type_key = %type_key, records = count, orphans = orphans.len(), "Spilled batch");
    if !orphans.is_empty() {
        if let Err(e) = store.registry.delete_objects(&orphans) {
            warn!(target: "geocache::registry", error = %e, "Failed to delete orphaned objects");
        }
    }
}

/// Backend assistant over an [`ObjectRegistry`]
pub struct RegistryAssistant {
    store: Arc<RegistryStore>,
    ctx: BackendContext,
    block_size: usize,
    /// Classes written this session, dropped on shutdown
    classes: Mutex<FxHashSet<String>>,
}

impl RegistryAssistant {
    /// Assistant with the standard accessors
    pub fn new(ctx: BackendContext, registry: Arc<dyn ObjectRegistry>, block_size: usize) -> Self {
        Self::with_store(ctx, RegistryStore::new(registry), block_size)
    }

    /// Assistant over a prepared store
    pub fn with_store(ctx: BackendContext, store: RegistryStore, block_size: usize) -> Self {
        Self {
            store: Arc::new(store),
            ctx,
            block_size: block_size.max(1),
            classes: Mutex::new(FxHashSet::default()),
        }
    }

    /// The underlying store
    pub fn store(&self) -> &Arc<RegistryStore> {
        &self.store
    }

    /// Class the next spill of `type_key` writes to
    pub fn class_of(&self, type_key: &TypeKey) -> String {
        class_name(type_key, self.ctx.registry.partition_of(type_key))
    }
}

impl BackendAssistant for RegistryAssistant {
    fn name(&self) -> &'static str {
        "registry"
    }

    fn cache_elements(&self, type_key: &TypeKey, entries: Vec<(RecordId, Arc<CacheEntry>)>) {
        if entries.is_empty() {
            return;
        }
        let class = self.class_of(type_key);
        self.classes.lock().insert(class.clone());
        let mut entries = entries.into_iter().peekable();
        while entries.peek().is_some() {
            let batch: Vec<_> = entries.by_ref().take(self.block_size).collect();
            let store = Arc::clone(&self.store);
            let type_key = type_key.clone();
            let class = class.clone();
            submit_or_run(&self.ctx.pools.spill, TaskPriority::BulkInsert, move || {
                spill_batch(&store, &type_key, &class, batch)
            });
        }
    }

    fn retrieve_and_update(
        &self,
        parts: PartSet,
        batch: Vec<RetrieveRequest>,
        update: RetrieveUpdate,
    ) -> Vec<Retrieved> {
        fan_out_retrieve(&self.store, &self.ctx, |r| self.group_key(r), parts, batch, update)
    }

    fn remove_elements(&self, refs: Vec<StoreRef>) {
        let ids: Vec<u64> = refs
            .iter()
            .filter_map(StoreRef::as_registry)
            .map(RegistryRef::external_id)
            .collect();
        for chunk in ids.chunks(self.block_size) {
            let store = Arc::clone(&self.store);
            let chunk = chunk.to_vec();
            submit_or_run(&self.ctx.pools.spill, TaskPriority::Removal, move || {
                if let Err(e) = store.registry.delete_objects(&chunk) {
                    warn!(target: "geocache::registry", objects = chunk.len(), error = %e, "Failed to delete objects");
                }
            });
        }
    }

    fn data_type_removed(&self, type_key: &TypeKey) {
        // Called before the type registry forgets the partition
        let Some(partition) = self.ctx.registry.existing_partition(type_key) else {
            return;
        };
        let class = class_name(type_key, partition);
        self.classes.lock().remove(&class);
        let store = Arc::clone(&self.store);
        let type_key = type_key.clone();
        submit_or_run(&self.ctx.pools.spill, TaskPriority::Maintenance, move || {
            match store.registry.delete_class(&class) {
                Ok(n) => info!(target: "geocache::registry", type_key = %type_key, class = %class, objects = n, "Deleted class of removed type"),
                Err(e) => warn!(target: "geocache::registry", type_key = %type_key, class = %class, error = %e, "Failed to delete class"),
            }
        });
    }

    fn direct_access_retriever(&self, _type_key: &TypeKey) -> Arc<dyn DirectAccessRetriever> {
        Arc::new(RegistryRetriever {
            store: Arc::clone(&self.store),
        })
    }

    fn preferred_insert_block_size(&self) -> usize {
        self.block_size
    }

    fn group_key(&self, store_ref: &StoreRef) -> u64 {
        match store_ref {
            StoreRef::Registry(r) => r.external_id() / self.block_size as u64,
            StoreRef::Disk(r) => ((r.partition() as u64) << 32) | r.insert_file_id() as u64,
        }
    }

    fn shutdown(&self) {
        let classes: Vec<String> = self.classes.lock().drain().collect();
        for class in classes {
            if let Err(e) = self.store.registry.delete_class(&class) {
                warn!(target: "geocache::registry", class = %class, error = %e, "Failed to delete class on shutdown");
            }
        }
    }
}

struct RegistryRetriever {
    store: Arc<RegistryStore>,
}

impl DirectAccessRetriever for RegistryRetriever {
    fn retrieve(&self, store_ref: &StoreRef, parts: PartSet) -> Result<Payload> {
        let r = store_ref
            .as_registry()
            .ok_or_else(|| Error::invalid_argument("not a registry reference"))?;
        let readable = parts.intersection(r.presence().parts());
        if readable.is_empty() {
            return Ok(Payload::empty());
        }
        self.store
            .fetch(&[r.external_id()], &[readable])
            .pop()
            .unwrap_or_else(|| Err(Error::RegistryError("empty registry answer".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::IoPools;
    use crate::config::CacheConfig;
    use geocache_core::{Coordinate, TimeSpan, VisualState};
    use geocache_storage::{CacheRegistry, EntryMap};

    struct Fixture {
        ctx: BackendContext,
        registry: Arc<InMemoryRegistry>,
        assistant: RegistryAssistant,
        parcels: TypeKey,
    }

    fn fixture(block_size: usize) -> Fixture {
        let ctx = BackendContext {
            entries: Arc::new(EntryMap::new()),
            registry: Arc::new(CacheRegistry::new()),
            pools: Arc::new(IoPools::from_config(&CacheConfig::default())),
        };
        let registry = Arc::new(InMemoryRegistry::new());
        let assistant = RegistryAssistant::new(ctx.clone(), registry.clone(), block_size);
        let parcels = ctx.registry.intern_type("parcels", "cadastre");
        Fixture {
            ctx,
            registry,
            assistant,
            parcels,
        }
    }

    fn payload(i: u64) -> Payload {
        Payload::new(
            Some(u64::MAX - i),
            Some(vec![MetadataValue::Float(i as f64 * 0.5)]),
            Some(Geometry::Polygon {
                exterior: vec![
                    Coordinate::new(0.0, 0.0),
                    Coordinate::new(i as f64, 0.0),
                    Coordinate::new(i as f64, 1.0),
                    Coordinate::new(0.0, 0.0),
                ],
                holes: vec![],
            }),
        )
    }

    fn insert(f: &Fixture, count: u64) -> Vec<(RecordId, Arc<CacheEntry>)> {
        (0..count)
            .map(|i| {
                let id = f.ctx.registry.ids().allocate();
                let entry = f.ctx.entries.insert(
                    id,
                    CacheEntry::new(
                        f.parcels.clone(),
                        TimeSpan::ALL,
                        VisualState::new(),
                        payload(i),
                        f.ctx.entries.tick(),
                    ),
                );
                (id, entry)
            })
            .collect()
    }

    fn requests(inserted: &[(RecordId, Arc<CacheEntry>)]) -> Vec<RetrieveRequest> {
        inserted
            .iter()
            .map(|(id, e)| RetrieveRequest::for_entry(*id, Arc::clone(e)).unwrap())
            .collect()
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    #[test]
    fn test_accessors_round_trip_each_part() {
        let store = RegistryStore::new(Arc::new(InMemoryRegistry::new()));
        let (properties, presence) = store.encode(&payload(3)).unwrap();
        assert_eq!(presence.parts(), PartSet::ALL);
        assert!(matches!(properties["origin_id"], PropertyValue::Int(_)));
        assert!(matches!(properties["metadata"], PropertyValue::List(_)));
        assert!(matches!(properties["geometry"], PropertyValue::Blob(_)));

        assert_eq!(store.decode(properties, PartSet::ALL).unwrap(), payload(3));
    }

    #[test]
    fn test_null_parts_are_not_stored() {
        let store = RegistryStore::new(Arc::new(InMemoryRegistry::new()));
        let (properties, presence) = store
            .encode(&Payload::new(Some(7), None, None))
            .unwrap();
        assert_eq!(properties.len(), 1);
        assert!(presence.origin_id_cached());
        assert!(!presence.metadata_cached());
    }

    #[test]
    fn test_wrong_property_kind_is_rejected() {
        let mut payload = Payload::empty();
        assert!(GeometryAccessor
            .decode(PropertyValue::Int(1), &mut payload)
            .is_err());
        assert!(MetadataAccessor
            .decode(PropertyValue::Blob(vec![1]), &mut payload)
            .is_err());
    }

    // ========================================================================
    // In-memory registry
    // ========================================================================

    #[test]
    fn test_in_memory_registry_ids_are_consecutive() {
        let registry = InMemoryRegistry::new();
        let ids = registry
            .insert_objects("a", vec![PropertyMap::new(), PropertyMap::new()])
            .unwrap();
        assert_eq!(ids, vec![1, 2]);
        registry.insert_objects("b", vec![PropertyMap::new()]).unwrap();
        assert_eq!(registry.class_len("a"), 2);
        assert_eq!(registry.delete_class("a").unwrap(), 2);
        assert_eq!(registry.delete_objects(&[3, 3, 9]).unwrap(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_offline_registry_fails() {
        let registry = InMemoryRegistry::new();
        registry.set_offline(true);
        assert!(registry.insert_objects("a", vec![]).is_err());
        registry.set_offline(false);
        assert!(registry.insert_objects("a", vec![]).is_ok());
    }

    // ========================================================================
    // Assistant
    // ========================================================================

    #[test]
    fn test_spill_and_retrieve() {
        let f = fixture(4);
        let inserted = insert(&f, 10);
        f.assistant.cache_elements(&f.parcels, inserted.clone());
        f.ctx.pools.drain();
        assert_eq!(f.registry.class_len(&f.assistant.class_of(&f.parcels)), 10);

        for (_, entry) in &inserted {
            assert!(f.ctx.entries.evict(entry));
        }
        let results = f.assistant.retrieve_and_update(
            PartSet::ALL,
            requests(&inserted),
            RetrieveUpdate::merge_and_touch(f.ctx.entries.tick()),
        );
        for (i, r) in results.iter().enumerate() {
            assert_eq!(**r.payload.as_ref().unwrap(), payload(i as u64));
        }
        assert_eq!(f.ctx.entries.resident_count(), 10);
        f.ctx.pools.shutdown();
    }

    #[test]
    fn test_failed_insert_leaves_records_resident() {
        let f = fixture(4);
        f.registry.set_offline(true);
        let inserted = insert(&f, 3);
        f.assistant.cache_elements(&f.parcels, inserted.clone());
        f.ctx.pools.drain();
        for (_, entry) in &inserted {
            assert!(!entry.is_spilled());
            assert!(!f.ctx.entries.evict(entry));
        }
        f.ctx.pools.shutdown();
    }

    #[test]
    fn test_deleted_object_is_per_record_failure() {
        let f = fixture(10);
        let inserted = insert(&f, 3);
        f.assistant.cache_elements(&f.parcels, inserted.clone());
        f.ctx.pools.drain();
        for (_, entry) in &inserted {
            f.ctx.entries.evict(entry);
        }
        let victim = inserted[1].1.store_ref().unwrap();
        f.registry
            .delete_objects(&[victim.as_registry().unwrap().external_id()])
            .unwrap();

        let results = f
            .assistant
            .retrieve_and_update(PartSet::ALL, requests(&inserted), RetrieveUpdate::READ_ONLY);
        let failed: Vec<bool> = results.iter().map(Retrieved::is_failed).collect();
        assert_eq!(failed, vec![false, true, false]);
        f.ctx.pools.shutdown();
    }

    #[test]
    fn test_spill_skips_removed_entries() {
        let f = fixture(10);
        let inserted = insert(&f, 3);
        f.ctx.entries.remove(inserted[0].0);
        spill_batch(f.assistant.store(), &f.parcels, "parcels", inserted.clone());
        assert_eq!(f.registry.len(), 2);
        assert!(!inserted[0].1.is_spilled());
        assert!(inserted[1].1.is_spilled());
        f.ctx.pools.shutdown();
    }

    /// Removes one entry while its batch is being inserted
    struct RemovingRegistry {
        inner: InMemoryRegistry,
        entries: Arc<EntryMap>,
        victim: RecordId,
    }

    impl ObjectRegistry for RemovingRegistry {
        fn insert_objects(&self, class: &str, objects: Vec<PropertyMap>) -> Result<Vec<u64>> {
            self.entries.remove(self.victim);
            self.inner.insert_objects(class, objects)
        }

        fn query_properties(&self, ids: &[u64], properties: &[&str]) -> Result<Vec<Option<PropertyMap>>> {
            self.inner.query_properties(ids, properties)
        }

        fn delete_objects(&self, ids: &[u64]) -> Result<usize> {
            self.inner.delete_objects(ids)
        }

        fn delete_class(&self, class: &str) -> Result<usize> {
            self.inner.delete_class(class)
        }
    }

    #[test]
    fn test_objects_of_entries_removed_during_spill_are_deleted() {
        let f = fixture(10);
        let inserted = insert(&f, 3);
        let racing = Arc::new(RemovingRegistry {
            inner: InMemoryRegistry::new(),
            entries: Arc::clone(&f.ctx.entries),
            victim: inserted[2].0,
        });
        let store = RegistryStore::new(racing.clone());
        spill_batch(&store, &f.parcels, "parcels", inserted.clone());

        assert_eq!(racing.inner.len(), 2);
        assert!(inserted[0].1.is_spilled());
        assert!(!inserted[2].1.is_spilled());
        assert!(!f.ctx.entries.contains(inserted[2].0));
        f.ctx.pools.shutdown();
    }

    #[test]
    fn test_remove_elements_and_type() {
        let f = fixture(2);
        let inserted = insert(&f, 5);
        f.assistant.cache_elements(&f.parcels, inserted.clone());
        f.ctx.pools.drain();

        let refs: Vec<StoreRef> = inserted[..2]
            .iter()
            .filter_map(|(_, e)| e.store_ref())
            .collect();
        f.assistant.remove_elements(refs);
        f.ctx.pools.drain();
        assert_eq!(f.registry.len(), 3);

        f.assistant.data_type_removed(&f.parcels);
        f.ctx.pools.drain();
        assert!(f.registry.is_empty());
        f.ctx.pools.shutdown();
    }

    /// Holds class deletion long enough for later spills to land first
    struct SlowDeleteRegistry {
        inner: InMemoryRegistry,
    }

    impl ObjectRegistry for SlowDeleteRegistry {
        fn insert_objects(&self, class: &str, objects: Vec<PropertyMap>) -> Result<Vec<u64>> {
            self.inner.insert_objects(class, objects)
        }

        fn query_properties(&self, ids: &[u64], properties: &[&str]) -> Result<Vec<Option<PropertyMap>>> {
            self.inner.query_properties(ids, properties)
        }

        fn delete_objects(&self, ids: &[u64]) -> Result<usize> {
            self.inner.delete_objects(ids)
        }

        fn delete_class(&self, class: &str) -> Result<usize> {
            std::thread::sleep(std::time::Duration::from_millis(200));
            self.inner.delete_class(class)
        }
    }

    #[test]
    fn test_removed_type_class_spares_later_spills() {
        let f = fixture(10);
        let slow = Arc::new(SlowDeleteRegistry {
            inner: InMemoryRegistry::new(),
        });
        let assistant = RegistryAssistant::new(f.ctx.clone(), slow.clone(), 10);

        assistant.cache_elements(&f.parcels, insert(&f, 3));
        f.ctx.pools.drain();
        let retired = assistant.class_of(&f.parcels);
        assert_eq!(slow.inner.class_len(&retired), 3);

        assistant.data_type_removed(&f.parcels);
        f.ctx.registry.forget_type(&f.parcels);
        let fresh = insert(&f, 4);
        assistant.cache_elements(&f.parcels, fresh.clone());
        f.ctx.pools.drain();

        assert_ne!(assistant.class_of(&f.parcels), retired);
        assert_eq!(slow.inner.class_len(&retired), 0);
        assert_eq!(slow.inner.len(), 4);
        assert!(fresh.iter().all(|(_, e)| e.is_spilled()));
        f.ctx.pools.shutdown();
    }

    #[test]
    fn test_direct_access() {
        let f = fixture(10);
        let inserted = insert(&f, 1);
        f.assistant.cache_elements(&f.parcels, inserted.clone());
        f.ctx.pools.drain();

        let store_ref = inserted[0].1.store_ref().unwrap();
        let retriever = f.assistant.direct_access_retriever(&f.parcels);
        let p = retriever.retrieve(&store_ref, PartSet::ORIGIN_ID).unwrap();
        assert_eq!(p.origin_id, Some(u64::MAX));
        assert!(p.geometry.is_none());
        f.ctx.pools.shutdown();
    }

    #[test]
    fn test_shutdown_drops_session_classes() {
        let f = fixture(10);
        f.registry
            .insert_objects("unrelated", vec![PropertyMap::new()])
            .unwrap();
        f.assistant.cache_elements(&f.parcels, insert(&f, 2));
        f.ctx.pools.drain();
        f.ctx.pools.shutdown();
        f.assistant.shutdown();
        assert_eq!(f.registry.len(), 1);
        assert_eq!(f.registry.class_len("unrelated"), 1);
    }
}
