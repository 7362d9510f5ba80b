//! Backend assistants
//!
//! A [`BackendAssistant`] owns the secondary store. It spills payloads of
//! freshly inserted entries in the background, fetches evicted parts back
//! for queries and releases data of removed records.
//!
//! Two implementations exist:
//!
//! - [`DiskAssistant`]: append-only partitioned block files
//! - [`RegistryAssistant`]: external keyed [`ObjectRegistry`]
//!
//! Both share the same [`BackendContext`] (entry map, type registry, I/O
//! pools) and the same retrieval plumbing: requests are grouped by
//! [`BackendAssistant::group_key`], each group runs as one task on the fetch
//! pool, and the caller blocks on a [`CompletionLatch`] until all groups of
//! the call have finished.

pub mod disk;
pub mod registry;

pub use disk::{DiskAssistant, DiskStore};
pub use registry::{
    default_accessors, GeometryAccessor, InMemoryRegistry, MetadataAccessor, ObjectRegistry,
    OriginIdAccessor, PropertyAccessor, PropertyMap, PropertyValue, RegistryAssistant,
    RegistryStore,
};

use geocache_core::{PartSet, Payload, RecordId, Result, TypeKey};
use geocache_storage::{CacheEntry, CacheRegistry, EntryMap, StoreRef};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::warn;

use crate::background::{BackgroundScheduler, CompletionLatch, IoPools, TaskPriority};

/// Shared state every assistant works against
#[derive(Clone)]
pub struct BackendContext {
    /// Live entries (spill completions and merges go through it)
    pub entries: Arc<EntryMap>,
    /// Types, partitions and schemas
    pub registry: Arc<CacheRegistry>,
    /// Spill and fetch pools
    pub pools: Arc<IoPools>,
}

/// One record to fetch
#[derive(Debug, Clone)]
pub struct RetrieveRequest {
    /// Record id
    pub id: RecordId,
    /// Entry to update
    pub entry: Arc<CacheEntry>,
    /// Where its parts live
    pub store_ref: StoreRef,
}

impl RetrieveRequest {
    /// Build a request from an entry, if it has been spilled
    pub fn for_entry(id: RecordId, entry: Arc<CacheEntry>) -> Option<Self> {
        let store_ref = entry.store_ref()?;
        Some(Self {
            id,
            entry,
            store_ref,
        })
    }
}

/// What to do with fetched parts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrieveUpdate {
    /// Merge fetched parts into the entry's resident payload
    pub merge: bool,
    /// Last-used stamp to apply to every fetched entry
    pub stamp: Option<u64>,
}

impl RetrieveUpdate {
    /// Fetch only; leave the entries untouched
    pub const READ_ONLY: RetrieveUpdate = RetrieveUpdate {
        merge: false,
        stamp: None,
    };

    /// Merge and stamp
    pub fn merge_and_touch(stamp: u64) -> Self {
        Self {
            merge: true,
            stamp: Some(stamp),
        }
    }
}

/// Result of one fetch
#[derive(Debug, Clone)]
pub struct Retrieved {
    /// Record id
    pub id: RecordId,
    /// Entry the parts belong to
    pub entry: Arc<CacheEntry>,
    /// Resident parts combined with the fetched ones; `None` if the fetch
    /// failed (already logged)
    pub payload: Option<Arc<Payload>>,
}

impl Retrieved {
    /// Whether the fetch failed
    pub fn is_failed(&self) -> bool {
        self.payload.is_none()
    }
}

/// Point lookups of one type outside the query protocol
pub trait DirectAccessRetriever: Send + Sync {
    /// Fetch the given parts of one record
    ///
    /// Returns only what is stored; parts never cached come back null.
    fn retrieve(&self, store_ref: &StoreRef, parts: PartSet) -> Result<Payload>;
}

/// Secondary store behind the cache
pub trait BackendAssistant: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Spill freshly inserted entries in the background
    ///
    /// Entries are split into batches of [`preferred_insert_block_size`];
    /// each batch attaches references to its entries when it completes.
    /// Data written for an entry removed in the meantime is released again.
    ///
    /// [`preferred_insert_block_size`]: BackendAssistant::preferred_insert_block_size
    fn cache_elements(&self, type_key: &TypeKey, entries: Vec<(RecordId, Arc<CacheEntry>)>);

    /// Fetch the missing `parts` of every request, blocking until done
    ///
    /// Results come back in ascending id order; failed records are
    /// reported with a `None` payload.
    fn retrieve_and_update(
        &self,
        parts: PartSet,
        batch: Vec<RetrieveRequest>,
        update: RetrieveUpdate,
    ) -> Vec<Retrieved>;

    /// Release backend data of removed records in the background
    fn remove_elements(&self, refs: Vec<StoreRef>);

    /// Purge a removed type's storage in the background
    fn data_type_removed(&self, type_key: &TypeKey);

    /// Retriever for point lookups of one type
    fn direct_access_retriever(&self, type_key: &TypeKey) -> Arc<dyn DirectAccessRetriever>;

    /// Records per spill batch
    fn preferred_insert_block_size(&self) -> usize;

    /// Retrieval grouping key; requests with the same key are fetched in
    /// one pass
    fn group_key(&self, store_ref: &StoreRef) -> u64;

    /// Release every resource; called once when the cache closes
    fn shutdown(&self);
}

/// Fetches one group of requests
pub(crate) trait GroupFetcher: Send + Sync + 'static {
    /// Fetch the parts each request is missing, in request order
    ///
    /// `wanted[i]` is the set of parts to read for `group[i]`.
    fn fetch_group(&self, group: &[RetrieveRequest], wanted: &[PartSet]) -> Vec<Result<Payload>>;
}

/// Run a retrieval batch over the fetch pool
///
/// Groups run as `Retrieve` tasks; a group the pool refuses runs on the
/// calling thread. Entries whose wanted parts became resident in the
/// meantime are answered without a read.
pub(crate) fn fan_out_retrieve<F>(
    fetcher: &Arc<F>,
    ctx: &BackendContext,
    group_key: impl Fn(&StoreRef) -> u64,
    parts: PartSet,
    batch: Vec<RetrieveRequest>,
    update: RetrieveUpdate,
) -> Vec<Retrieved>
where
    F: GroupFetcher,
{
    let mut groups: FxHashMap<u64, Vec<RetrieveRequest>> = FxHashMap::default();
    for request in batch {
        groups
            .entry(group_key(&request.store_ref))
            .or_default()
            .push(request);
    }

    let results = Arc::new(Mutex::new(Vec::new()));
    let latch = CompletionLatch::new(groups.len());

    for (_, group) in groups {
        let fetcher = Arc::clone(fetcher);
        let entries = Arc::clone(&ctx.entries);
        let sink = Arc::clone(&results);
        let guard = latch.guard();
        let task = move || {
            let _guard = guard;
            let done = run_group(&*fetcher, &entries, parts, group, update);
            sink.lock().extend(done);
        };

        submit_or_run(&ctx.pools.fetch, TaskPriority::Retrieve, task);
    }

    latch.wait();
    let mut results = std::mem::take(&mut *results.lock());
    results.sort_unstable_by_key(|r: &Retrieved| r.id);
    results
}

/// Queue a task, running it on the calling thread if the pool refuses it
pub(crate) fn submit_or_run<T>(scheduler: &BackgroundScheduler, priority: TaskPriority, task: T)
where
    T: FnOnce() + Send + 'static,
{
    // submit() consumes the closure even when it refuses it; the work sits
    // in a slot the inline fallback can take back
    let slot = Arc::new(Mutex::new(Some(task)));
    let queued = Arc::clone(&slot);
    let submitted = scheduler.submit(priority, move || {
        if let Some(task) = queued.lock().take() {
            task();
        }
    });
    if let Err(e) = submitted {
        warn!(target: "geocache::backend", pool = scheduler.name(), ?priority, error = %e, "Pool refused task, running inline");
        if let Some(task) = slot.lock().take() {
            task();
        }
    }
}

fn run_group<F: GroupFetcher + ?Sized>(
    fetcher: &F,
    entries: &EntryMap,
    parts: PartSet,
    group: Vec<RetrieveRequest>,
    update: RetrieveUpdate,
) -> Vec<Retrieved> {
    let wanted: Vec<PartSet> = group
        .iter()
        .map(|r| {
            r.entry
                .missing_parts(parts)
                .intersection(r.store_ref.presence().parts())
        })
        .collect();

    let (to_read, read_wanted): (Vec<RetrieveRequest>, Vec<PartSet>) = group
        .iter()
        .zip(&wanted)
        .filter(|(_, w)| !w.is_empty())
        .map(|(r, w)| (r.clone(), *w))
        .unzip();
    let mut fetched = fetcher.fetch_group(&to_read, &read_wanted).into_iter();

    let mut out = Vec::with_capacity(group.len());
    for (request, wanted) in group.into_iter().zip(wanted) {
        let resident = request.entry.payload();
        let payload = if wanted.is_empty() {
            Some(resident.unwrap_or_else(|| Arc::new(Payload::empty())))
        } else {
            match fetched.next() {
                Some(Ok(parts_read)) => {
                    if update.merge {
                        entries.merge_payload(&request.entry, &parts_read);
                    }
                    let combined = match resident {
                        Some(current) => current.merge(&parts_read),
                        None => parts_read,
                    };
                    Some(Arc::new(combined))
                }
                Some(Err(e)) => {
                    warn!(target: "geocache::backend", id = %request.id, error = %e, "Record retrieval failed, skipping");
                    None
                }
                None => None,
            }
        };
        if payload.is_some() {
            if let Some(stamp) = update.stamp {
                request.entry.touch(stamp);
            }
        }
        out.push(Retrieved {
            id: request.id,
            entry: request.entry,
            payload,
        });
    }
    out
}
