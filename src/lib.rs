//! geocache - tiered cache for decoded geospatial feature records
//!
//! geocache keeps millions of lightweight record descriptors in memory while
//! only a bounded working set of payloads (origin id, metadata, geometry)
//! stays resident. Cold payloads are spilled to a secondary store (block
//! files on disk, or an external object registry) and reloaded on demand
//! during queries.
//!
//! # Quick Start
//!
//! ```ignore
//! use geocache::{CollectingQuery, FeatureCache, FeatureRecord, PartSet, QueryScope, TimeSpan};
//!
//! let cache = FeatureCache::builder()
//!     .disk_root("/var/tmp/geocache")
//!     .resident_pool_size(50_000)
//!     .open()?;
//!
//! let ids = cache.insert("roads", "osm", vec![
//!     FeatureRecord::new(TimeSpan::new(0, 1_000)).with_origin_id(42),
//! ])?;
//!
//! let mut query = CollectingQuery::new(PartSet::ALL);
//! cache.query(&QueryScope::Ids(ids), &mut query)?;
//! ```
//!
//! # Architecture
//!
//! All operations go through [`FeatureCache`]. Lower layers (entry map,
//! block format, reference encoding) live in `geocache-storage` and are
//! re-exported here only where callers name their types.

pub use geocache_core::{
    BoundingBox, Coordinate, Error, FeatureRecord, FieldDescriptor, FieldKind, Geometry, MetadataValue,
    PartSet, Payload, PayloadPart, RecordId, RecordSchema, Result, TimeSpan, TypeKey, VisualState,
};
pub use geocache_engine::*;
pub use geocache_storage::{CacheRegistry, CipherFactory, CodecError, EntryDescriptor, PartCipher};
