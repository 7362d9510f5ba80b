//! Cache entries
//!
//! A [`CacheEntry`] is the always-resident descriptor of one record. Its
//! mutable slot (visual state, secondary-store reference, payload snapshot)
//! sits behind one small lock; the last-used stamp is a separate atomic so
//! that queries can refresh it without contending on the slot.
//!
//! # Payload transitions
//!
//! ```text
//!   insert ──► Unspilled ──spill completes──► Evictable ──evict──► PayloadFree
//!                                                 ▲                     │
//!                                                 └────── retrieve ─────┘
//! ```
//!
//! An entry without a reference is never evicted: its payload exists nowhere
//! else.

use geocache_core::{PartSet, Payload, RecordId, TimeSpan, TypeKey, VisualState};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::reference::StoreRef;

/// Eviction classification of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// Payload in memory, no reference yet: must stay resident
    Unspilled,
    /// No payload in memory
    PayloadFree,
    /// Payload in memory and durable in the backend
    Evictable,
}

#[derive(Debug)]
struct EntrySlot {
    visual_state: VisualState,
    store_ref: Option<StoreRef>,
    payload: Option<Arc<Payload>>,
    retired: bool,
}

/// Always-resident descriptor of one record
#[derive(Debug)]
pub struct CacheEntry {
    type_key: TypeKey,
    time_span: TimeSpan,
    last_used: AtomicU64,
    slot: Mutex<EntrySlot>,
}

impl CacheEntry {
    /// Create an entry holding a fresh, unspilled payload
    pub fn new(
        type_key: TypeKey,
        time_span: TimeSpan,
        visual_state: VisualState,
        payload: Payload,
        stamp: u64,
    ) -> Self {
        Self {
            type_key,
            time_span,
            last_used: AtomicU64::new(stamp),
            slot: Mutex::new(EntrySlot {
                visual_state,
                store_ref: None,
                payload: Some(Arc::new(payload)),
                retired: false,
            }),
        }
    }

    /// Record type
    pub fn type_key(&self) -> &TypeKey {
        &self.type_key
    }

    /// Validity interval
    pub fn time_span(&self) -> TimeSpan {
        self.time_span
    }

    /// Current display state
    pub fn visual_state(&self) -> VisualState {
        self.slot.lock().visual_state
    }

    /// Replace the display state
    pub fn set_visual_state(&self, state: VisualState) {
        self.slot.lock().visual_state = state;
    }

    /// Last-used stamp
    pub fn last_used(&self) -> u64 {
        self.last_used.load(Ordering::Relaxed)
    }

    /// Move the last-used stamp forward (never backward)
    pub fn touch(&self, stamp: u64) {
        self.last_used.fetch_max(stamp, Ordering::Relaxed);
    }

    /// Snapshot of the resident payload
    pub fn payload(&self) -> Option<Arc<Payload>> {
        self.slot.lock().payload.clone()
    }

    /// Copy of the secondary-store reference
    pub fn store_ref(&self) -> Option<StoreRef> {
        self.slot.lock().store_ref.clone()
    }

    /// Whether a reference has been attached
    pub fn is_spilled(&self) -> bool {
        self.slot.lock().store_ref.is_some()
    }

    /// Parts currently in memory
    pub fn resident_parts(&self) -> PartSet {
        self.slot
            .lock()
            .payload
            .as_ref()
            .map_or(PartSet::NONE, |p| p.present_parts())
    }

    /// Required parts that are not in memory but can be fetched
    ///
    /// A part absent from memory and from the reference was never cached;
    /// it resolves to null without a fetch.
    pub fn missing_parts(&self, required: PartSet) -> PartSet {
        let slot = self.slot.lock();
        let resident = slot
            .payload
            .as_ref()
            .map_or(PartSet::NONE, |p| p.present_parts());
        let stored = slot
            .store_ref
            .as_ref()
            .map_or(PartSet::NONE, |r| r.presence().parts());
        required.difference(resident).intersection(stored)
    }

    /// Whether serving `required` needs a backend fetch
    pub fn needs_retrieve(&self, required: PartSet) -> bool {
        !self.missing_parts(required).is_empty()
    }

    /// Eviction classification
    pub fn residency(&self) -> Residency {
        let slot = self.slot.lock();
        match (&slot.payload, &slot.store_ref) {
            (None, _) => Residency::PayloadFree,
            (Some(_), None) => Residency::Unspilled,
            (Some(_), Some(_)) => Residency::Evictable,
        }
    }

    /// Attach the reference produced by a spill
    ///
    /// Returns false if a reference was already present (the first one wins)
    /// or the entry was removed while the spill was in flight.
    pub fn attach_store_ref(&self, store_ref: StoreRef) -> bool {
        let mut slot = self.slot.lock();
        if slot.retired || slot.store_ref.is_some() {
            return false;
        }
        slot.store_ref = Some(store_ref);
        true
    }

    /// Merge retrieved parts into the payload
    ///
    /// Returns true if the entry went from payload-free to resident.
    pub fn merge_payload(&self, retrieved: &Payload) -> bool {
        if retrieved.is_empty() {
            return false;
        }
        let mut slot = self.slot.lock();
        if slot.retired {
            return false;
        }
        match slot.payload.as_ref() {
            Some(current) => {
                if !current.present_parts().is_superset(retrieved.present_parts()) {
                    slot.payload = Some(Arc::new(current.merge(retrieved)));
                }
                false
            }
            None => {
                slot.payload = Some(Arc::new(retrieved.clone()));
                true
            }
        }
    }

    /// Drop the payload if the entry is durable
    ///
    /// Returns true if a payload was dropped. Unspilled entries are left
    /// untouched.
    pub fn evict_payload(&self) -> bool {
        let mut slot = self.slot.lock();
        if slot.store_ref.is_none() {
            return false;
        }
        slot.payload.take().is_some()
    }

    /// Mark the entry removed, dropping its payload and reference
    ///
    /// After retirement no spill can attach and no retrieve can merge, so a
    /// removed record never becomes resident again.
    pub fn retire(&self) -> Retired {
        let mut slot = self.slot.lock();
        slot.retired = true;
        Retired {
            had_payload: slot.payload.take().is_some(),
            store_ref: slot.store_ref.take(),
        }
    }

    /// Whether the entry was removed
    pub fn is_retired(&self) -> bool {
        self.slot.lock().retired
    }

    /// Descriptor-only view
    pub fn descriptor(&self, id: RecordId) -> EntryDescriptor {
        let slot = self.slot.lock();
        EntryDescriptor {
            id,
            type_key: self.type_key.clone(),
            time_span: self.time_span,
            visual_state: slot.visual_state,
            last_used: self.last_used(),
            spilled: slot.store_ref.is_some(),
            resident_parts: slot
                .payload
                .as_ref()
                .map_or(PartSet::NONE, |p| p.present_parts()),
        }
    }
}

/// What an entry held when it was retired
#[derive(Debug)]
pub struct Retired {
    /// Whether a payload was resident
    pub had_payload: bool,
    /// Reference to release in the backend
    pub store_ref: Option<StoreRef>,
}

/// Copy of an entry's descriptor fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryDescriptor {
    /// Record id
    pub id: RecordId,
    /// Record type
    pub type_key: TypeKey,
    /// Validity interval
    pub time_span: TimeSpan,
    /// Display state
    pub visual_state: VisualState,
    /// Last-used stamp
    pub last_used: u64,
    /// Whether the payload has a durable copy
    pub spilled: bool,
    /// Parts currently in memory
    pub resident_parts: PartSet,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::{DiskRef, PartLengths};
    use geocache_core::{Coordinate, Geometry, MetadataValue};

    fn entry() -> CacheEntry {
        let payload = Payload::new(
            Some(1),
            Some(vec![MetadataValue::Int(2)]),
            Some(Geometry::Point(Coordinate::new(0.0, 0.0))),
        );
        CacheEntry::new(
            TypeKey::new("t"),
            TimeSpan::new(0, 10),
            VisualState::new(),
            payload,
            1,
        )
    }

    fn disk_ref(origin: u64, metadata: u64, geometry: u64) -> StoreRef {
        StoreRef::Disk(
            DiskRef::new(
                0,
                0,
                0,
                PartLengths {
                    origin_id: origin,
                    metadata,
                    geometry,
                },
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_unspilled_entry_is_never_evicted() {
        let e = entry();
        assert_eq!(e.residency(), Residency::Unspilled);
        assert!(!e.evict_payload());
        assert!(e.payload().is_some());
    }

    #[test]
    fn test_evict_after_spill() {
        let e = entry();
        assert!(e.attach_store_ref(disk_ref(8, 10, 10)));
        assert_eq!(e.residency(), Residency::Evictable);
        assert!(e.evict_payload());
        assert_eq!(e.residency(), Residency::PayloadFree);
        // Idempotent
        assert!(!e.evict_payload());
    }

    #[test]
    fn test_first_reference_wins() {
        let e = entry();
        assert!(e.attach_store_ref(disk_ref(8, 10, 10)));
        assert!(!e.attach_store_ref(disk_ref(8, 0, 0)));
        assert!(e.store_ref().unwrap().presence().metadata_cached());
    }

    #[test]
    fn test_missing_parts_respects_presence() {
        let e = entry();
        e.attach_store_ref(disk_ref(8, 0, 10));
        e.evict_payload();
        // Metadata was never cached: not fetchable
        assert_eq!(e.missing_parts(PartSet::ALL), PartSet::ORIGIN_ID.union(PartSet::GEOMETRY));
        assert!(!e.needs_retrieve(PartSet::METADATA));
        assert!(e.needs_retrieve(PartSet::GEOMETRY));
    }

    #[test]
    fn test_missing_parts_without_reference_is_empty() {
        let e = entry();
        assert!(e.missing_parts(PartSet::ALL).is_empty());
    }

    #[test]
    fn test_merge_payload_transitions() {
        let e = entry();
        e.attach_store_ref(disk_ref(8, 10, 10));
        let original = e.payload().unwrap();
        e.evict_payload();

        let part = original.restricted_to(PartSet::GEOMETRY);
        assert!(e.merge_payload(&part));
        assert_eq!(e.resident_parts(), PartSet::GEOMETRY);
        // Second merge fills gaps but is not a residency transition
        assert!(!e.merge_payload(&original));
        assert_eq!(e.payload().unwrap().as_ref(), original.as_ref());
        assert!(!e.merge_payload(&Payload::empty()));
    }

    #[test]
    fn test_touch_is_monotonic() {
        let e = entry();
        e.touch(10);
        e.touch(5);
        assert_eq!(e.last_used(), 10);
    }

    #[test]
    fn test_descriptor_copies_fields() {
        let e = entry();
        e.set_visual_state(VisualState::new().with_flag(VisualState::SELECTED, true));
        let d = e.descriptor(RecordId::new(4));
        assert_eq!(d.id, RecordId::new(4));
        assert_eq!(d.time_span, TimeSpan::new(0, 10));
        assert!(d.visual_state.has(VisualState::SELECTED));
        assert!(!d.spilled);
        assert_eq!(d.resident_parts, PartSet::ALL);
    }

    #[test]
    fn test_retire_clears_and_blocks_updates() {
        let e = entry();
        e.attach_store_ref(disk_ref(8, 1, 1));
        let snapshot = e.payload().unwrap();
        let retired = e.retire();
        assert!(retired.had_payload);
        assert!(retired.store_ref.is_some());
        assert!(e.is_retired());
        assert!(e.payload().is_none());

        assert!(!e.merge_payload(&snapshot));
        assert!(!e.attach_store_ref(disk_ref(8, 1, 1)));
        assert!(e.payload().is_none());
    }
}
