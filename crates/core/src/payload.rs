//! Evictable record payload
//!
//! A [`Payload`] is the hot data of a record: origin id, metadata and
//! geometry. Each part is independently nullable. Payloads are immutable
//! snapshots; the cache shares them by `Arc` and replaces the whole snapshot
//! when parts are attached (retrieve) or dropped (evict). A query that holds
//! a snapshot keeps seeing consistent data even if the entry is evicted
//! underneath it.

use std::fmt;
use std::sync::Arc;

use crate::geometry::Geometry;
use crate::schema::RecordSchema;
use crate::value::MetadataValue;

/// One of the three payload parts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadPart {
    /// Id of the record in its source format
    OriginId,
    /// Ordered metadata fields
    Metadata,
    /// Shape
    Geometry,
}

impl PayloadPart {
    /// All parts in on-disk order
    pub const ALL: [PayloadPart; 3] = [
        PayloadPart::OriginId,
        PayloadPart::Metadata,
        PayloadPart::Geometry,
    ];

    fn bit(self) -> u8 {
        match self {
            PayloadPart::OriginId => 0b001,
            PayloadPart::Metadata => 0b010,
            PayloadPart::Geometry => 0b100,
        }
    }
}

/// Small set of payload parts
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PartSet(u8);

impl PartSet {
    /// No parts
    pub const NONE: PartSet = PartSet(0);
    /// Origin id only
    pub const ORIGIN_ID: PartSet = PartSet(0b001);
    /// Metadata only
    pub const METADATA: PartSet = PartSet(0b010);
    /// Geometry only
    pub const GEOMETRY: PartSet = PartSet(0b100);
    /// Every part
    pub const ALL: PartSet = PartSet(0b111);

    /// Build from raw bits (upper bits ignored)
    pub const fn from_bits(bits: u8) -> Self {
        PartSet(bits & 0b111)
    }

    /// Raw bits
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Membership test
    pub fn contains(&self, part: PayloadPart) -> bool {
        self.0 & part.bit() != 0
    }

    /// Copy with a part added
    pub fn with(self, part: PayloadPart) -> Self {
        PartSet(self.0 | part.bit())
    }

    /// Union
    pub fn union(self, other: PartSet) -> Self {
        PartSet(self.0 | other.0)
    }

    /// Parts in `self` but not in `other`
    pub fn difference(self, other: PartSet) -> Self {
        PartSet(self.0 & !other.0)
    }

    /// Intersection
    pub fn intersection(self, other: PartSet) -> Self {
        PartSet(self.0 & other.0)
    }

    /// Whether every part of `other` is in `self`
    pub fn is_superset(&self, other: PartSet) -> bool {
        other.0 & !self.0 == 0
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterate parts in on-disk order
    pub fn iter(self) -> impl Iterator<Item = PayloadPart> {
        PayloadPart::ALL.into_iter().filter(move |p| self.contains(*p))
    }
}

impl fmt::Debug for PartSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Hot data of a record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload {
    /// Id of the record in its source
    pub origin_id: Option<u64>,
    /// Metadata fields, ordered by the type's schema
    pub metadata: Option<Arc<[MetadataValue]>>,
    /// Shape
    pub geometry: Option<Arc<Geometry>>,
}

impl Payload {
    /// Payload with every part null
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a payload from owned parts
    pub fn new(
        origin_id: Option<u64>,
        metadata: Option<Vec<MetadataValue>>,
        geometry: Option<Geometry>,
    ) -> Self {
        Self {
            origin_id,
            metadata: metadata.map(Arc::from),
            geometry: geometry.map(Arc::new),
        }
    }

    /// Parts that are non-null
    pub fn present_parts(&self) -> PartSet {
        let mut parts = PartSet::NONE;
        if self.origin_id.is_some() {
            parts = parts.with(PayloadPart::OriginId);
        }
        if self.metadata.is_some() {
            parts = parts.with(PayloadPart::Metadata);
        }
        if self.geometry.is_some() {
            parts = parts.with(PayloadPart::Geometry);
        }
        parts
    }

    /// Whether every part is null
    pub fn is_empty(&self) -> bool {
        self.present_parts().is_empty()
    }

    /// Combine two snapshots: parts present in `self` win, gaps are filled
    /// from `other`. Merging is idempotent and order-insensitive for data
    /// coming from the same record.
    pub fn merge(&self, other: &Payload) -> Payload {
        Payload {
            origin_id: self.origin_id.or(other.origin_id),
            metadata: self.metadata.clone().or_else(|| other.metadata.clone()),
            geometry: self.geometry.clone().or_else(|| other.geometry.clone()),
        }
    }

    /// Copy keeping only the given parts
    pub fn restricted_to(&self, parts: PartSet) -> Payload {
        Payload {
            origin_id: self
                .origin_id
                .filter(|_| parts.contains(PayloadPart::OriginId)),
            metadata: self
                .metadata
                .clone()
                .filter(|_| parts.contains(PayloadPart::Metadata)),
            geometry: self
                .geometry
                .clone()
                .filter(|_| parts.contains(PayloadPart::Geometry)),
        }
    }

    /// Metadata field by schema name
    pub fn field<'a>(&'a self, schema: &RecordSchema, name: &str) -> Option<&'a MetadataValue> {
        let idx = schema.field_index(name)?;
        self.metadata.as_ref()?.get(idx)
    }

    /// Approximate memory footprint of the resident parts
    pub fn approx_size(&self) -> usize {
        let mut size = std::mem::size_of::<Payload>();
        if let Some(meta) = &self.metadata {
            size += meta.iter().map(MetadataValue::approx_size).sum::<usize>();
        }
        if let Some(geometry) = &self.geometry {
            size += geometry.coordinate_count() * std::mem::size_of::<crate::Coordinate>();
        }
        size
    }
}
