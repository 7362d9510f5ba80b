//! The feature cache
//!
//! [`FeatureCache`] ties the layers together:
//! - entry map and record index (always resident)
//! - backend assistant (disk or registry) spilling payloads on the spill pool
//! - query engine fetching misses on the fetch pool
//! - eviction controller keeping the resident pool bounded
//!
//! Open one with [`FeatureCache::builder`] or [`FeatureCache::open`].
//! Dropping the cache closes it: pools are drained and stopped, then the
//! backend removes its session data.

use geocache_core::{Error, FeatureRecord, PartSet, Payload, RecordId, RecordSchema, Result, TypeKey};
use geocache_storage::{
    session_cipher, CacheEntry, CacheRegistry, CipherFactory, EntryDescriptor, EntryMap, RecordIndex,
};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backend::{BackendAssistant, BackendContext, DiskAssistant, ObjectRegistry, RegistryAssistant};
use crate::background::IoPools;
use crate::config::{BackendKind, CacheConfig};
use crate::eviction::{EvictionController, EvictionPolicy, EvictionStats, MemoryMonitor, MemoryPressure, PressureWatcher};
use crate::filter::{FilterSet, LoadFilter};
use crate::listener::{CacheListener, ListenerSet};
use crate::query::{CacheQuery, QueryEngine, QueryScope, QueryStats};

// ============================================================================
// Cache Builder
// ============================================================================

/// Builder for [`FeatureCache`]
///
/// ```ignore
/// use geocache_engine::FeatureCache;
///
/// // Disk backend with defaults
/// let cache = FeatureCache::builder().disk_root("/var/tmp/geocache").open()?;
///
/// // Registry backend
/// let cache = FeatureCache::builder()
///     .object_registry(Arc::new(InMemoryRegistry::new()))
///     .resident_pool_size(10_000)
///     .open()?;
/// ```
pub struct CacheBuilder {
    config: CacheConfig,
    registry: Option<Arc<CacheRegistry>>,
    cipher_factory: Option<Arc<dyn CipherFactory>>,
    object_registry: Option<Arc<dyn ObjectRegistry>>,
    listeners: Vec<Arc<dyn CacheListener>>,
    monitor: Option<(Arc<dyn MemoryMonitor>, Duration)>,
}

impl CacheBuilder {
    /// Builder with the default configuration
    pub fn new() -> Self {
        Self {
            config: CacheConfig::default(),
            registry: None,
            cipher_factory: None,
            object_registry: None,
            listeners: Vec::new(),
            monitor: None,
        }
    }

    /// Builder seeded from a `geocache.toml` file
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new().config(CacheConfig::from_file(path.as_ref())?))
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Root directory of the disk store
    pub fn disk_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.config.disk_root = Some(root.into());
        self
    }

    /// Payloads kept in memory under nominal pressure
    pub fn resident_pool_size(mut self, size: usize) -> Self {
        self.config.resident_pool_size = size;
        self.config.min_resident = self.config.min_resident.min(size);
        self
    }

    /// Entry-count bound
    pub fn max_entries(mut self, max: usize) -> Self {
        self.config.max_entries = max;
        self.config.unlimited = false;
        self
    }

    /// Remove the entry-count bound
    pub fn unlimited(mut self) -> Self {
        self.config.unlimited = true;
        self
    }

    /// Share a type registry with other caches
    pub fn registry(mut self, registry: Arc<CacheRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Encrypt metadata and geometry with ciphers from `factory`
    pub fn cipher(mut self, factory: Arc<dyn CipherFactory>) -> Self {
        self.cipher_factory = Some(factory);
        self.config.encryption = true;
        self
    }

    /// Spill into an external object registry instead of disk
    pub fn object_registry(mut self, registry: Arc<dyn ObjectRegistry>) -> Self {
        self.object_registry = Some(registry);
        self.config.backend = BackendKind::Registry;
        self
    }

    /// Register a listener before any record is added
    pub fn listener(mut self, listener: Arc<dyn CacheListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Poll `monitor` every `interval` and evict on escalation
    pub fn memory_monitor(mut self, monitor: Arc<dyn MemoryMonitor>, interval: Duration) -> Self {
        self.monitor = Some((monitor, interval));
        self
    }

    /// Open the cache
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - the configuration is invalid
    /// - the registry backend is selected without an object registry
    /// - the disk session directory cannot be created
    /// - a background thread cannot be spawned
    pub fn open(self) -> Result<FeatureCache> {
        let config = self.config;
        config.validate()?;

        let registry = self.registry.unwrap_or_default();
        let entries = Arc::new(EntryMap::with_capacity(config.resident_pool_size));
        let pools = Arc::new(IoPools::from_config(&config));
        let ctx = BackendContext {
            entries: Arc::clone(&entries),
            registry: Arc::clone(&registry),
            pools: Arc::clone(&pools),
        };

        let backend: Arc<dyn BackendAssistant> = match config.backend {
            BackendKind::Disk => {
                let cipher = if config.encryption {
                    if self.cipher_factory.is_none() {
                        warn!(target: "geocache::cache", "Encryption requested without a cipher factory, payloads will be stored unencrypted");
                    }
                    session_cipher(self.cipher_factory.as_deref())
                } else {
                    None
                };
                Arc::new(DiskAssistant::open(
                    ctx,
                    &config.disk_root(),
                    cipher,
                    config.max_records_per_file,
                )?)
            }
            BackendKind::Registry => {
                let object_registry = self.object_registry.ok_or_else(|| {
                    Error::ConfigError("registry backend requires an object registry".to_string())
                })?;
                if config.encryption {
                    warn!(target: "geocache::cache", "Registry backend stores payloads unencrypted");
                }
                Arc::new(RegistryAssistant::new(ctx, object_registry, config.registry_block_size))
            }
        };

        let policy = EvictionPolicy {
            pool_size: config.resident_pool_size,
            min_resident: config.min_resident,
            debounce: config.eviction_debounce(),
        };
        let eviction = match EvictionController::start(Arc::clone(&entries), policy) {
            Ok(controller) => Arc::new(controller),
            Err(e) => {
                pools.shutdown();
                backend.shutdown();
                return Err(e);
            }
        };

        let cache = FeatureCache {
            config,
            registry,
            entries,
            index: Arc::new(RecordIndex::new()),
            pools,
            backend,
            eviction,
            watcher: Mutex::new(None),
            listeners: ListenerSet::new(),
            filters: FilterSet::new(),
            admission: Mutex::new(()),
            closed: AtomicBool::new(false),
        };
        for listener in self.listeners {
            cache.listeners.add(listener);
        }
        if let Some((monitor, interval)) = self.monitor {
            cache.watch_memory(monitor, interval)?;
        }

        info!(
            target: "geocache::cache",
            backend = cache.backend.name(),
            pool_size = cache.config.resident_pool_size,
            max_entries = cache.config.max_entries,
            unlimited = cache.config.unlimited,
            "Feature cache opened"
        );
        Ok(cache)
    }
}

impl Default for CacheBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Feature Cache
// ============================================================================

/// Tiered cache of decoded feature records
pub struct FeatureCache {
    config: CacheConfig,
    registry: Arc<CacheRegistry>,
    entries: Arc<EntryMap>,
    index: Arc<RecordIndex>,
    pools: Arc<IoPools>,
    backend: Arc<dyn BackendAssistant>,
    eviction: Arc<EvictionController>,
    watcher: Mutex<Option<PressureWatcher>>,
    listeners: ListenerSet,
    filters: FilterSet,
    /// Serializes the capacity check with the commit of new entries
    admission: Mutex<()>,
    closed: AtomicBool,
}

impl FeatureCache {
    /// Start configuring a cache
    pub fn builder() -> CacheBuilder {
        CacheBuilder::new()
    }

    /// Open a cache from a configuration
    ///
    /// The registry backend needs an object registry; use
    /// [`CacheBuilder::object_registry`] for it.
    pub fn open(config: CacheConfig) -> Result<Self> {
        CacheBuilder::new().config(config).open()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::invalid_argument("cache is closed"));
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Types
    // ------------------------------------------------------------------------

    /// Type key for a category and source, interning it if new
    pub fn type_key(&self, category: &str, source: &str) -> TypeKey {
        self.registry.intern_type(category, source)
    }

    /// Type key for a category and source, if it was ever interned
    pub fn lookup_type(&self, category: &str, source: &str) -> Option<TypeKey> {
        self.registry.lookup(&TypeKey::compose(category, source))
    }

    /// Attach a metadata schema to a type
    pub fn register_schema(&self, category: &str, source: &str, schema: RecordSchema) -> TypeKey {
        let type_key = self.type_key(category, source);
        self.registry.register_schema(&type_key, schema);
        type_key
    }

    /// Schema of a type
    pub fn schema(&self, type_key: &TypeKey) -> Option<Arc<RecordSchema>> {
        self.registry.schema(type_key)
    }

    /// Types holding at least one record (or registered and emptied)
    pub fn types(&self) -> Vec<TypeKey> {
        self.index.types()
    }

    /// Live records of a type
    pub fn count_for_type(&self, type_key: &TypeKey) -> usize {
        self.index.count_for_type(type_key)
    }

    /// Live ids of a type, ascending
    pub fn ids_for_type(&self, type_key: &TypeKey) -> Vec<RecordId> {
        self.index.ids_for_type(type_key)
    }

    // ------------------------------------------------------------------------
    // Insert / remove
    // ------------------------------------------------------------------------

    /// Add records of one type
    ///
    /// Returns one id per record, in input order. Records rejected by the
    /// type's load filter get [`RecordId::FILTERED`] and are not stored.
    /// Payloads are spilled in the background; the call never waits for
    /// the backend.
    ///
    /// # Errors
    ///
    /// Returns `Error::CapacityExceeded` if the accepted records would push
    /// the entry count past `max_entries`. Nothing is added in that case.
    pub fn insert(&self, category: &str, source: &str, records: Vec<FeatureRecord>) -> Result<Vec<RecordId>> {
        self.ensure_open()?;
        let type_key = self.registry.intern_type(category, source);
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let accepted: Vec<bool> = match self.filters.get(&type_key) {
            Some(filter) => records.iter().map(|r| filter.accept(r)).collect(),
            None => vec![true; records.len()],
        };
        let incoming = accepted.iter().filter(|a| **a).count();

        let mut ids = Vec::with_capacity(records.len());
        let mut added = Vec::with_capacity(incoming);
        let new_ids = {
            let _admission = self.admission.lock();
            let current = self.entries.len();
            if !self.config.unlimited && current + incoming > self.config.max_entries {
                return Err(Error::CapacityExceeded {
                    current,
                    incoming,
                    max: self.config.max_entries,
                });
            }
            if incoming > 0 {
                self.eviction.request_headroom(incoming);
            }

            self.index.add_type(&type_key);
            let stamp = self.entries.tick();
            for (record, keep) in records.into_iter().zip(accepted) {
                if !keep {
                    ids.push(RecordId::FILTERED);
                    continue;
                }
                let id = self.registry.ids().allocate();
                let (time_span, visual_state, payload) = record.into_payload();
                let entry = self.entries.insert(
                    id,
                    CacheEntry::new(type_key.clone(), time_span, visual_state, payload, stamp),
                );
                ids.push(id);
                added.push((id, entry));
            }
            let new_ids: Vec<RecordId> = added.iter().map(|(id, _)| *id).collect();
            self.index.add_ids(&type_key, &new_ids);
            new_ids
        };

        debug!(
            target: "geocache::cache",
            type_key = %type_key,
            added = new_ids.len(),
            filtered = ids.len() - new_ids.len(),
            "Records inserted"
        );
        self.backend.cache_elements(&type_key, added);
        self.listeners.notify_added(&type_key, &new_ids);
        Ok(ids)
    }

    /// Remove records
    ///
    /// Unknown ids (and the filter sentinel) are ignored. Returns how many
    /// records were removed. Backend data is released in the background
    /// when `remove_from_store_on_remove` is set.
    pub fn remove(&self, ids: &[RecordId]) -> usize {
        let mut by_type: FxHashMap<TypeKey, Vec<RecordId>> = FxHashMap::default();
        let mut refs = Vec::new();
        for &id in ids {
            if id.is_filtered() {
                continue;
            }
            if let Some((entry, retired)) = self.entries.remove(id) {
                by_type.entry(entry.type_key().clone()).or_default().push(id);
                refs.extend(retired.store_ref);
            }
        }

        let mut removed = 0;
        for (type_key, ids) in &by_type {
            self.index.remove_ids(type_key, ids);
            removed += ids.len();
            self.listeners.notify_removed(type_key, ids);
        }
        if self.config.remove_from_store_on_remove && !refs.is_empty() {
            self.backend.remove_elements(refs);
        }
        if removed > 0 {
            debug!(target: "geocache::cache", removed, types = by_type.len(), "Records removed");
        }
        removed
    }

    /// Remove every record of a type and drop its backend storage
    ///
    /// Returns how many records were removed.
    pub fn remove_type(&self, type_key: &TypeKey) -> usize {
        let mut removed = self.remove(&self.index.ids_for_type(type_key));

        // Partition lookup needs the registry entry, so the backend goes first
        self.backend.data_type_removed(type_key);
        self.registry.forget_type(type_key);

        removed += self.remove_stragglers(type_key);

        self.listeners.notify_type_removed(type_key);
        info!(target: "geocache::cache", type_key = %type_key, removed, "Type removed");
        removed
    }

    /// Drop the index of a type, removing entries inserted after the id snapshot
    fn remove_stragglers(&self, type_key: &TypeKey) -> usize {
        let stragglers = self.index.remove_type(type_key);
        if stragglers.is_empty() {
            return 0;
        }
        let mut removed = 0;
        let mut refs = Vec::new();
        for &id in &stragglers {
            if let Some((_, retired)) = self.entries.remove(id) {
                refs.extend(retired.store_ref);
                removed += 1;
            }
        }
        if !refs.is_empty() {
            self.backend.remove_elements(refs);
        }
        self.listeners.notify_removed(type_key, &stragglers);
        removed
    }

    // ------------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------------

    /// Run a query
    ///
    /// Blocks until every dispatched retrieval wave has completed.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` for an empty id set or a closed cache.
    pub fn query(&self, scope: &QueryScope, query: &mut dyn CacheQuery) -> Result<QueryStats> {
        self.ensure_open()?;
        let stats = QueryEngine::new(
            &self.entries,
            &self.index,
            self.backend.as_ref(),
            self.config.retrieve_wave_groups,
        )
        .run(scope, query)?;
        if stats.retrieved > 0 {
            self.eviction.request_headroom(0);
        }
        Ok(stats)
    }

    /// Descriptor of a record, without touching its payload
    pub fn descriptor(&self, id: RecordId) -> Option<EntryDescriptor> {
        self.entries.get(id).map(|e| e.descriptor(id))
    }

    /// Payload parts of one record
    ///
    /// Parts that are not resident are read through the backend's direct
    /// retriever. The entry itself is left unchanged. Returns `None` for an
    /// unknown id.
    pub fn payload(&self, id: RecordId, parts: PartSet) -> Result<Option<Payload>> {
        let Some(entry) = self.entries.get(id) else {
            return Ok(None);
        };
        let resident = entry.payload();
        let missing = entry.missing_parts(parts);
        let combined = match (missing.is_empty(), entry.store_ref()) {
            (false, Some(store_ref)) => {
                let fetched = self
                    .backend
                    .direct_access_retriever(entry.type_key())
                    .retrieve(&store_ref, missing)?;
                match resident {
                    Some(resident) => resident.merge(&fetched),
                    None => fetched,
                }
            }
            _ => resident.map(|p| (*p).clone()).unwrap_or_default(),
        };
        Ok(Some(combined.restricted_to(parts)))
    }

    /// Whether a record is live
    pub fn contains(&self, id: RecordId) -> bool {
        self.entries.contains(id)
    }

    /// Live records
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache holds no records
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records whose payload is in memory
    pub fn resident_count(&self) -> usize {
        self.entries.resident_count()
    }

    // ------------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------------

    /// Wait for pending spills, then evict down to the pool size
    pub fn clean(&self) -> EvictionStats {
        self.pools.spill.drain();
        let stats = self.eviction.run_now(MemoryPressure::Nominal);
        debug!(target: "geocache::cache", evicted = stats.evicted, resident = self.resident_count(), "Clean pass complete");
        stats
    }

    /// React to a memory status reported by the host
    pub fn on_memory_pressure(&self, status: MemoryPressure) {
        if status != MemoryPressure::Nominal {
            self.eviction.request(status);
        }
    }

    /// Poll a memory monitor, replacing any previous one
    pub fn watch_memory(&self, monitor: Arc<dyn MemoryMonitor>, interval: Duration) -> Result<()> {
        self.ensure_open()?;
        let watcher = PressureWatcher::start(monitor, Arc::clone(&self.eviction), interval)?;
        if let Some(previous) = self.watcher.lock().replace(watcher) {
            previous.shutdown();
        }
        Ok(())
    }

    /// Eviction controller of this cache
    pub fn eviction(&self) -> &EvictionController {
        &self.eviction
    }

    // ------------------------------------------------------------------------
    // Hooks
    // ------------------------------------------------------------------------

    /// Install a load filter for a type
    pub fn set_load_filter(&self, type_key: &TypeKey, filter: Arc<dyn LoadFilter>) {
        self.filters.set(type_key.clone(), filter);
    }

    /// Remove a type's load filter
    pub fn clear_load_filter(&self, type_key: &TypeKey) -> bool {
        self.filters.clear(type_key)
    }

    /// Subscribe to add/remove notifications
    pub fn add_listener(&self, listener: Arc<dyn CacheListener>) {
        self.listeners.add(listener);
    }

    /// Unsubscribe a listener
    pub fn remove_listener(&self, listener: &Arc<dyn CacheListener>) -> bool {
        self.listeners.remove(listener)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Configuration in effect
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Type registry of this cache
    pub fn registry(&self) -> &Arc<CacheRegistry> {
        &self.registry
    }

    /// Backend in use
    pub fn backend(&self) -> &Arc<dyn BackendAssistant> {
        &self.backend
    }

    /// Wait until every queued spill has reached the backend
    pub fn flush(&self) {
        self.pools.spill.drain();
    }

    /// Wait until both I/O pools are idle
    pub fn drain(&self) {
        self.pools.drain();
    }

    /// Stop background work and remove session data
    ///
    /// Queued spills and removals run before the backend shuts down.
    /// Idempotent; also called on drop.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.shutdown();
        }
        self.eviction.shutdown();
        self.pools.shutdown();
        self.backend.shutdown();
        info!(target: "geocache::cache", records = self.entries.len(), "Feature cache closed");
    }

    /// Check if the cache was closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for FeatureCache {
    fn drop(&mut self) {
        self.close();
    }
}
