//! Query engine
//!
//! A query is a behavioral contract ([`CacheQuery`]), not a data structure.
//! The engine walks the candidate ids of a [`QueryScope`] and, for each:
//!
//! 1. absent entry → `not_found`
//! 2. time span outside the query's interest → skipped
//! 3. resident payload satisfies the query → `accepts_internal` /
//!    `process_internal` right away, last-used refreshed
//! 4. otherwise → queued for retrieval
//!
//! Queued misses are grouped by [`BackendAssistant::group_key`] and handed
//! to the backend in waves of at most `wave_groups` groups. `is_complete` is
//! checked before every candidate, every wave and every fetched record, so
//! a satisfied query stops dispatching new reads. Work already dispatched
//! runs to completion. `finalize_query_internal` runs last, exactly once.

use geocache_core::{Error, Geometry, MetadataValue, PartSet, Payload, RecordId, Result, TimeSpan, TypeKey, VisualState};
use geocache_storage::{CacheEntry, EntryMap, RecordIndex};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::backend::{BackendAssistant, RetrieveRequest, RetrieveUpdate};

/// Candidate ids of a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryScope {
    /// Explicit ids; must not be empty
    Ids(Vec<RecordId>),
    /// Every id of one type
    Type(TypeKey),
    /// Every live id
    All,
}

/// A matched record handed to the query
///
/// Holds its own snapshot of the payload, so eviction running meanwhile
/// never changes what the query sees.
#[derive(Debug, Clone)]
pub struct CachedRecord {
    id: RecordId,
    entry: Arc<CacheEntry>,
    payload: Option<Arc<Payload>>,
}

impl CachedRecord {
    pub(crate) fn new(id: RecordId, entry: Arc<CacheEntry>, payload: Option<Arc<Payload>>) -> Self {
        Self { id, entry, payload }
    }

    /// Record id
    pub fn id(&self) -> RecordId {
        self.id
    }

    /// The cache entry
    pub fn entry(&self) -> &CacheEntry {
        &self.entry
    }

    /// Record type
    pub fn type_key(&self) -> &TypeKey {
        self.entry.type_key()
    }

    /// Validity interval
    pub fn time_span(&self) -> TimeSpan {
        self.entry.time_span()
    }

    /// Display state
    pub fn visual_state(&self) -> VisualState {
        self.entry.visual_state()
    }

    /// Payload snapshot
    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_deref()
    }

    /// Origin id, if present
    pub fn origin_id(&self) -> Option<u64> {
        self.payload.as_ref().and_then(|p| p.origin_id)
    }

    /// Metadata values, if present
    pub fn metadata(&self) -> Option<&[MetadataValue]> {
        self.payload.as_ref().and_then(|p| p.metadata.as_deref())
    }

    /// Geometry, if present
    pub fn geometry(&self) -> Option<&Geometry> {
        self.payload.as_ref().and_then(|p| p.geometry.as_deref())
    }
}

/// Callback contract of a query
///
/// Only `required_parts` and `process_internal` must be provided.
pub trait CacheQuery {
    /// Payload parts the query reads
    fn required_parts(&self) -> PartSet;

    /// Whether the entry's time span is of interest
    fn intersects_times_of_interest(&self, _entry: &CacheEntry) -> bool {
        true
    }

    /// Whether the entry needs a backend fetch before it can be served
    fn needs_retrieve(&self, entry: &CacheEntry) -> bool {
        entry.needs_retrieve(self.required_parts())
    }

    /// Post-filter on a complete record
    fn accepts_internal(&self, _record: &CachedRecord) -> bool {
        true
    }

    /// Consume an accepted record
    fn process_internal(&mut self, record: CachedRecord);

    /// The id has no entry
    fn not_found(&mut self, _id: RecordId) {}

    /// Stop early once true
    fn is_complete(&self) -> bool {
        false
    }

    /// Called once after the last record
    fn finalize_query_internal(&mut self) {}

    /// Refresh the last-used stamp of served entries
    fn update_last_used(&self) -> bool {
        true
    }
}

/// Counters of one query run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryStats {
    /// Candidate ids looked at
    pub examined: usize,
    /// Records served from memory
    pub served_resident: usize,
    /// Records served after a fetch
    pub retrieved: usize,
    /// Fetches that failed (logged and skipped)
    pub retrieve_failed: usize,
    /// Ids without an entry
    pub not_found: usize,
    /// Records passed to `process_internal`
    pub accepted: usize,
    /// Retrieval waves dispatched
    pub waves: usize,
}

/// Runs queries against one cache's state
pub struct QueryEngine<'a> {
    entries: &'a EntryMap,
    index: &'a RecordIndex,
    backend: &'a dyn BackendAssistant,
    wave_groups: usize,
}

impl<'a> QueryEngine<'a> {
    /// Engine over the given state
    pub fn new(
        entries: &'a EntryMap,
        index: &'a RecordIndex,
        backend: &'a dyn BackendAssistant,
        wave_groups: usize,
    ) -> Self {
        Self {
            entries,
            index,
            backend,
            wave_groups: wave_groups.max(1),
        }
    }

    /// Run a query to completion or early exit
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` for an empty id set, before any
    /// callback or backend call.
    pub fn run(&self, scope: &QueryScope, query: &mut dyn CacheQuery) -> Result<QueryStats> {
        let ids = match scope {
            QueryScope::Ids(ids) if ids.is_empty() => {
                return Err(Error::invalid_argument("query id set is empty"));
            }
            QueryScope::Ids(ids) => {
                let mut ids = ids.clone();
                ids.sort_unstable();
                ids.dedup();
                ids
            }
            QueryScope::Type(type_key) => self.index.ids_for_type(type_key),
            QueryScope::All => self.index.all_ids(),
        };

        let mut stats = QueryStats::default();
        let touch = query.update_last_used();
        let stamp = self.entries.tick();
        let required = query.required_parts();
        let mut pending: BTreeMap<u64, Vec<RetrieveRequest>> = BTreeMap::new();

        for id in ids {
            if query.is_complete() {
                break;
            }
            stats.examined += 1;

            let Some(entry) = self.entries.get(id) else {
                stats.not_found += 1;
                query.not_found(id);
                continue;
            };
            if !query.intersects_times_of_interest(&entry) {
                continue;
            }
            if query.needs_retrieve(&entry) {
                if let Some(request) = RetrieveRequest::for_entry(id, Arc::clone(&entry)) {
                    pending
                        .entry(self.backend.group_key(&request.store_ref))
                        .or_default()
                        .push(request);
                    continue;
                }
            }

            if touch {
                entry.touch(stamp);
            }
            let payload = entry.payload();
            let record = CachedRecord::new(id, entry, payload);
            stats.served_resident += 1;
            if query.accepts_internal(&record) {
                stats.accepted += 1;
                query.process_internal(record);
            }
        }

        let update = RetrieveUpdate {
            merge: true,
            stamp: touch.then_some(stamp),
        };
        let mut groups = pending.into_values().peekable();
        while groups.peek().is_some() {
            if query.is_complete() {
                break;
            }
            let batch: Vec<RetrieveRequest> = groups
                .by_ref()
                .take(self.wave_groups)
                .flatten()
                .collect();
            stats.waves += 1;
            debug!(target: "geocache::query", wave = stats.waves, records = batch.len(), backend = self.backend.name(), "Dispatching retrieval wave");

            for fetched in self.backend.retrieve_and_update(required, batch, update) {
                if query.is_complete() {
                    break;
                }
                let Some(payload) = fetched.payload else {
                    stats.retrieve_failed += 1;
                    continue;
                };
                stats.retrieved += 1;
                let record = CachedRecord::new(fetched.id, fetched.entry, Some(payload));
                if query.accepts_internal(&record) {
                    stats.accepted += 1;
                    query.process_internal(record);
                }
            }
        }

        query.finalize_query_internal();
        Ok(stats)
    }
}

type RecordFilter = Box<dyn Fn(&CachedRecord) -> bool + Send>;

/// Query that collects accepted records
///
/// ```rust,ignore
/// let mut query = CollectingQuery::new(PartSet::ALL).with_limit(100);
/// cache.query(&QueryScope::Type(roads), &mut query)?;
/// for record in query.records() { /* ... */ }
/// ```
pub struct CollectingQuery {
    parts: PartSet,
    window: Option<TimeSpan>,
    limit: Option<usize>,
    filter: Option<RecordFilter>,
    touch: bool,
    records: Vec<CachedRecord>,
    missing: Vec<RecordId>,
    finalized: bool,
}

impl CollectingQuery {
    /// Collect every record, reading `parts`
    pub fn new(parts: PartSet) -> Self {
        Self {
            parts,
            window: None,
            limit: None,
            filter: None,
            touch: true,
            records: Vec::new(),
            missing: Vec::new(),
            finalized: false,
        }
    }

    /// Only records whose time span intersects `window`
    pub fn with_window(mut self, window: TimeSpan) -> Self {
        self.window = Some(window);
        self
    }

    /// Stop after `limit` records
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Only records the predicate accepts
    pub fn with_filter(mut self, filter: impl Fn(&CachedRecord) -> bool + Send + 'static) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    /// Leave last-used stamps alone
    pub fn without_touch(mut self) -> Self {
        self.touch = false;
        self
    }

    /// Collected records in delivery order
    pub fn records(&self) -> &[CachedRecord] {
        &self.records
    }

    /// Take the collected records
    pub fn into_records(self) -> Vec<CachedRecord> {
        self.records
    }

    /// Ids reported as not found
    pub fn not_found_ids(&self) -> &[RecordId] {
        &self.missing
    }

    /// Whether the query ran to its end
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }
}

impl CacheQuery for CollectingQuery {
    fn required_parts(&self) -> PartSet {
        self.parts
    }

    fn intersects_times_of_interest(&self, entry: &CacheEntry) -> bool {
        self.window
            .map_or(true, |w| entry.time_span().intersects(&w))
    }

    fn accepts_internal(&self, record: &CachedRecord) -> bool {
        self.filter.as_ref().map_or(true, |f| f(record))
    }

    fn process_internal(&mut self, record: CachedRecord) {
        self.records.push(record);
    }

    fn not_found(&mut self, id: RecordId) {
        self.missing.push(id);
    }

    fn is_complete(&self) -> bool {
        self.limit.map_or(false, |l| self.records.len() >= l)
    }

    fn finalize_query_internal(&mut self) {
        self.finalized = true;
    }

    fn update_last_used(&self) -> bool {
        self.touch
    }
}
