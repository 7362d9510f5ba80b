//! Sharded entry map
//!
//! Maps RecordId → `Arc<CacheEntry>` using a DashMap with the Fx hasher:
//! reads never block each other and writes only lock the target shard.
//!
//! The map also owns two counters the eviction policy relies on:
//!
//! - `resident`: number of entries whose payload is in memory. It only moves
//!   on real transitions reported by the entry (merge into a payload-free
//!   entry, eviction of a resident one, removal of a resident one).
//! - `clock`: logical last-used clock. Every query tick is strictly greater
//!   than the previous one, so LRU ordering is deterministic.

use dashmap::DashMap;
use geocache_core::{Payload, RecordId};
use rustc_hash::FxHasher;
use std::hash::BuildHasherDefault;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::entry::{CacheEntry, Residency, Retired};

type FxBuildHasher = BuildHasherDefault<FxHasher>;

/// Candidate for payload eviction
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    /// Record id
    pub id: RecordId,
    /// Last-used stamp at scan time
    pub last_used: u64,
    /// The entry itself
    pub entry: Arc<CacheEntry>,
}

/// Result of one classification scan
#[derive(Debug, Default)]
pub struct EvictionScan {
    /// Entries visited
    pub scanned: usize,
    /// Entries without a reference (must stay resident)
    pub unspilled: usize,
    /// Entries with no payload in memory
    pub payload_free: usize,
    /// Evictable entries, least recently used first
    pub candidates: Vec<EvictionCandidate>,
}

/// Concurrent map of live cache entries
#[derive(Debug)]
pub struct EntryMap {
    entries: DashMap<RecordId, Arc<CacheEntry>, FxBuildHasher>,
    resident: AtomicUsize,
    clock: AtomicU64,
}

impl EntryMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self {
            entries: DashMap::with_hasher(FxBuildHasher::default()),
            resident: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
        }
    }

    /// Create an empty map sized for `capacity` entries
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: DashMap::with_capacity_and_hasher(capacity, FxBuildHasher::default()),
            resident: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
        }
    }

    /// Advance the logical clock and return the new stamp
    #[inline]
    pub fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Current clock value without advancing it
    pub fn now(&self) -> u64 {
        self.clock.load(Ordering::Relaxed)
    }

    /// Insert a freshly built entry
    ///
    /// New entries always hold a payload and count as resident.
    pub fn insert(&self, id: RecordId, entry: CacheEntry) -> Arc<CacheEntry> {
        let resident = entry.residency() != Residency::PayloadFree;
        let entry = Arc::new(entry);
        if let Some(previous) = self.entries.insert(id, Arc::clone(&entry)) {
            if previous.retire().had_payload {
                self.resident.fetch_sub(1, Ordering::Relaxed);
            }
        }
        if resident {
            self.resident.fetch_add(1, Ordering::Relaxed);
        }
        entry
    }

    /// Look up an entry
    #[inline]
    pub fn get(&self, id: RecordId) -> Option<Arc<CacheEntry>> {
        self.entries.get(&id).map(|e| Arc::clone(e.value()))
    }

    /// Whether an entry exists
    pub fn contains(&self, id: RecordId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Remove and retire an entry
    ///
    /// Returns what the entry held so the caller can release backend data.
    pub fn remove(&self, id: RecordId) -> Option<(Arc<CacheEntry>, Retired)> {
        let (_, entry) = self.entries.remove(&id)?;
        let retired = entry.retire();
        if retired.had_payload {
            self.resident.fetch_sub(1, Ordering::Relaxed);
        }
        Some((entry, retired))
    }

    /// Stamp an entry with the given clock value
    pub fn touch(&self, id: RecordId, stamp: u64) -> bool {
        match self.entries.get(&id) {
            Some(e) => {
                e.touch(stamp);
                true
            }
            None => false,
        }
    }

    /// Merge retrieved parts into an entry, keeping the resident count exact
    pub fn merge_payload(&self, entry: &CacheEntry, payload: &Payload) {
        if entry.merge_payload(payload) {
            self.resident.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Evict an entry's payload if it is durable
    pub fn evict(&self, entry: &CacheEntry) -> bool {
        if entry.evict_payload() {
            self.resident.fetch_sub(1, Ordering::Relaxed);
            return true;
        }
        false
    }

    /// Classify every entry for an eviction pass
    ///
    /// Candidates (payload resident and durable) come back oldest first,
    /// ties broken by id.
    pub fn scan(&self) -> EvictionScan {
        let mut scan = EvictionScan::default();
        for e in self.entries.iter() {
            scan.scanned += 1;
            match e.value().residency() {
                Residency::Unspilled => scan.unspilled += 1,
                Residency::PayloadFree => scan.payload_free += 1,
                Residency::Evictable => scan.candidates.push(EvictionCandidate {
                    id: *e.key(),
                    last_used: e.value().last_used(),
                    entry: Arc::clone(e.value()),
                }),
            }
        }
        scan.candidates
            .sort_unstable_by_key(|c| (c.last_used, c.id));
        scan
    }

    /// Number of entries with a payload in memory
    pub fn resident_count(&self) -> usize {
        self.resident.load(Ordering::Relaxed)
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the map is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Live ids in ascending order
    pub fn ids(&self) -> Vec<RecordId> {
        let mut ids: Vec<RecordId> = self.entries.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }
}

impl Default for EntryMap {
    fn default() -> Self {
        Self::new()
    }
}
