//! Shared utilities for the engine integration tests.
//!
//! Import via `mod common;` from any test file.

#![allow(dead_code)]

use geocache_core::{
    Coordinate, FeatureRecord, Geometry, MetadataValue, PartSet, Payload, RecordId, TimeSpan, TypeKey,
};
use geocache_engine::{CacheConfig, CacheListener, FeatureCache, InMemoryRegistry, ObjectRegistry};
use geocache_storage::{CipherFactory, CodecError, PartCipher};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;
use std::sync::{Arc, Once};
use tempfile::TempDir;

// ============================================================================
// Initialization
// ============================================================================

static INIT_TRACING: Once = Once::new();

/// Route warnings from background workers to the test output.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::WARN)
            .try_init();
    });
}

// ============================================================================
// TestCache
// ============================================================================

/// Cache plus the temp dir backing it.
pub struct TestCache {
    pub cache: FeatureCache,
    pub dir: TempDir,
}

impl TestCache {
    /// Disk-backed cache with the given resident pool.
    pub fn disk(pool: usize) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let cache = FeatureCache::builder()
            .disk_root(dir.path())
            .resident_pool_size(pool)
            .open()
            .expect("Failed to open disk cache");
        TestCache { cache, dir }
    }

    /// Disk-backed cache with payload encryption.
    pub fn encrypted(pool: usize) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let cache = FeatureCache::builder()
            .disk_root(dir.path())
            .resident_pool_size(pool)
            .cipher(Arc::new(XorFactory))
            .open()
            .expect("Failed to open encrypted cache");
        TestCache { cache, dir }
    }

    /// Disk-backed cache from a full configuration; `disk_root` is overridden.
    pub fn with_config(config: CacheConfig) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let cache = FeatureCache::builder()
            .config(config)
            .disk_root(dir.path())
            .open()
            .expect("Failed to open configured cache");
        TestCache { cache, dir }
    }

    /// Registry-backed cache; returns the registry for inspection.
    pub fn registry(pool: usize) -> (Self, Arc<InMemoryRegistry>) {
        init_tracing();
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let objects = Arc::new(InMemoryRegistry::new());
        let cache = FeatureCache::builder()
            .object_registry(Arc::clone(&objects) as Arc<dyn ObjectRegistry>)
            .resident_pool_size(pool)
            .open()
            .expect("Failed to open registry cache");
        (TestCache { cache, dir }, objects)
    }

    /// Root of the disk store.
    pub fn root(&self) -> &Path {
        self.dir.path()
    }
}

/// Partition directories anywhere under `root`.
pub fn partition_dirs(root: &Path) -> Vec<u32> {
    let mut found = Vec::new();
    let Ok(sessions) = std::fs::read_dir(root) else {
        return found;
    };
    for session in sessions.flatten() {
        let Ok(children) = std::fs::read_dir(session.path()) else {
            continue;
        };
        for child in children.flatten() {
            let name = child.file_name();
            if let Some(p) = geocache_storage::format::parse_partition_dir(&name.to_string_lossy()) {
                found.push(p);
            }
        }
    }
    found.sort_unstable();
    found
}

// ============================================================================
// Record generation
// ============================================================================

/// Seeded generator of synthetic feature records.
pub struct RecordGen {
    rng: StdRng,
}

impl RecordGen {
    pub fn new(seed: u64) -> Self {
        RecordGen {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Full record numbered `i`; origin id is `i`.
    pub fn record(&mut self, i: u64) -> FeatureRecord {
        let start = i as i64 * 1_000;
        let end = start + self.rng.gen_range(1..1_000);
        let points = self.rng.gen_range(2..6);
        let line: Vec<Coordinate> = (0..points)
            .map(|_| Coordinate::new(self.rng.gen_range(-180.0..180.0), self.rng.gen_range(-90.0..90.0)))
            .collect();
        FeatureRecord::new(TimeSpan::new(start, end))
            .with_origin_id(i)
            .with_metadata(vec![
                MetadataValue::Int(i as i64),
                MetadataValue::Text(format!("feature-{i}")),
                MetadataValue::Float(self.rng.gen_range(0.0..1.0)),
            ])
            .with_geometry(Geometry::LineString(line))
    }

    /// Records numbered `from..from + count`.
    pub fn batch(&mut self, from: u64, count: u64) -> Vec<FeatureRecord> {
        (from..from + count).map(|i| self.record(i)).collect()
    }

    /// Record numbered `i` keeping only `parts`; other parts are null.
    pub fn partial(&mut self, i: u64, parts: PartSet) -> FeatureRecord {
        let full = self.record(i);
        let payload = full.clone().into_payload().2.restricted_to(parts);
        FeatureRecord {
            origin_id: payload.origin_id,
            metadata: payload.metadata.map(|m| m.to_vec()),
            geometry: payload.geometry.map(|g| (*g).clone()),
            ..full
        }
    }
}

/// Payload a record turns into once cached.
pub fn payload_of(record: &FeatureRecord) -> Payload {
    record.clone().into_payload().2
}

// ============================================================================
// Test doubles
// ============================================================================

/// Byte-flipping cipher; enough to prove parts pass through it.
pub struct XorCipher;

impl PartCipher for XorCipher {
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(plain.iter().map(|b| b ^ 0x5A).collect())
    }

    fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(sealed.iter().map(|b| b ^ 0x5A).collect())
    }

    fn cipher_id(&self) -> &str {
        "xor"
    }
}

pub struct XorFactory;

impl CipherFactory for XorFactory {
    fn create(&self) -> Result<Box<dyn PartCipher>, CodecError> {
        Ok(Box::new(XorCipher))
    }
}

/// Listener recording every notification.
#[derive(Default)]
pub struct RecordingListener {
    pub added: Mutex<Vec<(TypeKey, Vec<RecordId>)>>,
    pub removed: Mutex<Vec<(TypeKey, Vec<RecordId>)>>,
    pub types_removed: Mutex<Vec<TypeKey>>,
}

impl CacheListener for RecordingListener {
    fn records_added(&self, type_key: &TypeKey, ids: &[RecordId]) {
        self.added.lock().push((type_key.clone(), ids.to_vec()));
    }

    fn records_removed(&self, type_key: &TypeKey, ids: &[RecordId]) {
        self.removed.lock().push((type_key.clone(), ids.to_vec()));
    }

    fn type_removed(&self, type_key: &TypeKey) {
        self.types_removed.lock().push(type_key.clone());
    }
}
