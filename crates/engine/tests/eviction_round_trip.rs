//! Eviction round-trip tests
//!
//! Every combination of present and null parts must read back unchanged
//! after its payload left memory, for each backend:
//! - disk
//! - disk with encryption
//! - in-memory registry

mod common;

use common::{payload_of, RecordGen, TestCache};
use geocache_core::{FeatureRecord, PartSet, PayloadPart};
use geocache_engine::{CollectingQuery, FeatureCache, QueryScope};

/// Every subset of the three parts
fn part_subsets() -> Vec<PartSet> {
    (0u8..8)
        .map(|bits| {
            PayloadPart::ALL
                .iter()
                .enumerate()
                .filter(|(i, _)| bits & (1 << i) != 0)
                .fold(PartSet::NONE, |set, (_, part)| set.with(*part))
        })
        .collect()
}

/// Five records per subset of present parts
fn mixed_records() -> Vec<FeatureRecord> {
    let mut gen = RecordGen::new(23);
    let mut records = Vec::new();
    for (s, present) in part_subsets().into_iter().enumerate() {
        for k in 0..5u64 {
            records.push(gen.partial(s as u64 * 5 + k, present));
        }
    }
    records
}

fn assert_round_trip(cache: &FeatureCache) {
    let records = mixed_records();
    let ids = cache.insert("mixed", "synthetic", records.clone()).unwrap();

    for wanted in [PartSet::ORIGIN_ID, PartSet::METADATA, PartSet::GEOMETRY, PartSet::ALL] {
        cache.clean();
        assert!(cache.resident_count() <= 1, "resident = {}", cache.resident_count());

        let mut q = CollectingQuery::new(wanted);
        let stats = cache.query(&QueryScope::Ids(ids.clone()), &mut q).unwrap();
        assert_eq!(stats.accepted, records.len());
        assert_eq!(stats.retrieve_failed, 0);

        for record in q.records() {
            let idx = ids.iter().position(|id| *id == record.id()).unwrap();
            let expected = payload_of(&records[idx]).restricted_to(wanted);
            let actual = record.payload().cloned().unwrap_or_default().restricted_to(wanted);
            assert_eq!(actual, expected, "record {} parts {:?}", idx, wanted);
        }
    }

    // Point lookups agree with queries
    cache.clean();
    for (idx, id) in ids.iter().enumerate() {
        let payload = cache.payload(*id, PartSet::ALL).unwrap().unwrap();
        assert_eq!(payload, payload_of(&records[idx]));
    }
}

// ============================================================================
// Per backend
// ============================================================================

#[test]
fn test_disk_round_trip_per_part() {
    let t = TestCache::disk(1);
    assert_round_trip(&t.cache);
}

#[test]
fn test_encrypted_disk_round_trip_per_part() {
    let t = TestCache::encrypted(1);
    assert_round_trip(&t.cache);
}

#[test]
fn test_registry_round_trip_per_part() {
    let (t, objects) = TestCache::registry(1);
    assert_round_trip(&t.cache);
    assert_eq!(objects.len(), 40);
}

// ============================================================================
// Unspilled payloads
// ============================================================================

#[test]
fn test_unspilled_payloads_are_never_evicted() {
    let (t, objects) = TestCache::registry(5);
    objects.set_offline(true);

    let ids = t.cache.insert("roads", "osm", RecordGen::new(29).batch(0, 30)).unwrap();
    let stats = t.cache.clean();
    assert_eq!(stats.evicted, 0);
    assert_eq!(stats.unspilled, 30);
    assert_eq!(t.cache.resident_count(), 30);

    // Data is still served from memory
    let mut q = CollectingQuery::new(PartSet::ALL);
    let stats = t.cache.query(&QueryScope::Ids(ids.clone()), &mut q).unwrap();
    assert_eq!(stats.served_resident, 30);
    assert_eq!(stats.waves, 0);

    // Records inserted once the registry is back can be evicted
    objects.set_offline(false);
    t.cache.insert("roads", "osm", RecordGen::new(31).batch(30, 10)).unwrap();
    let stats = t.cache.clean();
    assert_eq!(stats.unspilled, 30);
    assert!(stats.evicted <= 10);
    assert_eq!(t.cache.resident_count(), 30);
    for id in &ids {
        assert!(t.cache.descriptor(*id).map_or(false, |d| !d.spilled));
    }
}
