//! Secondary-store references
//!
//! A [`StoreRef`] locates a record's spilled payload in the backend store and
//! records which of the three parts were written. Every live entry carries at
//! most one, so their size dominates the per-record overhead at scale.
//!
//! # Disk reference widths
//!
//! ```text
//! CompactDiskRef (inline, 20 bytes)       WideDiskRef (boxed, 8-byte pointer inline)
//! ┌────────────┬──────────┐               ┌────────────┬──────────┐
//! │ partition  │ u32      │               │ partition  │ u32      │
//! │ file       │ u32      │               │ file       │ u32      │
//! │ position   │ u32 (<2³¹)│              │ position   │ u64      │
//! │ total size │ u16      │               │ total size │ u32      │
//! │ origin len │ u16      │               │ origin len │ u32      │
//! │ meta end   │ u16      │               │ meta end   │ u32      │
//! │ presence   │ u8       │               │ presence   │ u8       │
//! └────────────┴──────────┘               └────────────┴──────────┘
//! ```
//!
//! The compact form is used when the record is smaller than
//! [`COMPACT_SIZE_LIMIT`] bytes and starts below 2³¹. Both forms answer the
//! same accessors; the choice only affects memory density.
//!
//! # Part ranges
//!
//! Offsets are relative to the record start:
//! origin id `[0, origin_len)`, metadata `[origin_len, meta_end)`,
//! geometry `[meta_end, total)`. A part that was not written has length zero
//! and its presence flag cleared.

use std::fmt;
use std::ops::Range;

use geocache_core::{PartSet, PayloadPart};

/// Records of this many bytes or more use the wide disk reference
pub const COMPACT_SIZE_LIMIT: u64 = 32_767;

/// Records starting at or beyond this offset use the wide disk reference
pub const COMPACT_POSITION_LIMIT: u64 = 1 << 31;

/// Which payload parts a reference holds in the backend
///
/// Immutable: created once with the reference and never changed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Presence(PartSet);

impl Presence {
    /// Presence from the set of written parts
    pub const fn new(parts: PartSet) -> Self {
        Presence(parts)
    }

    /// Written parts
    pub fn parts(&self) -> PartSet {
        self.0
    }

    /// Whether the origin id was written
    pub fn origin_id_cached(&self) -> bool {
        self.0.contains(PayloadPart::OriginId)
    }

    /// Whether metadata was written
    pub fn metadata_cached(&self) -> bool {
        self.0.contains(PayloadPart::Metadata)
    }

    /// Whether geometry was written
    pub fn geometry_cached(&self) -> bool {
        self.0.contains(PayloadPart::Geometry)
    }

    /// Whether `part` was written
    pub fn has(&self, part: PayloadPart) -> bool {
        self.0.contains(part)
    }
}

impl fmt::Debug for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Presence({:?})", self.0)
    }
}

/// Byte lengths of the three parts of an encoded record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PartLengths {
    /// Origin id bytes
    pub origin_id: u64,
    /// Metadata bytes (after cipher)
    pub metadata: u64,
    /// Geometry bytes (after cipher)
    pub geometry: u64,
}

impl PartLengths {
    /// Sum of all parts
    pub fn total(&self) -> u64 {
        self.origin_id + self.metadata + self.geometry
    }

    /// Parts with a non-zero length
    pub fn presence(&self) -> Presence {
        let mut parts = PartSet::NONE;
        if self.origin_id > 0 {
            parts = parts.with(PayloadPart::OriginId);
        }
        if self.metadata > 0 {
            parts = parts.with(PayloadPart::Metadata);
        }
        if self.geometry > 0 {
            parts = parts.with(PayloadPart::Geometry);
        }
        Presence::new(parts)
    }
}

/// Errors building a reference
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReferenceError {
    /// Record does not fit the wide reference's 32-bit size field
    #[error("record of {size} bytes exceeds the maximum encodable size")]
    RecordTooLarge {
        /// Total encoded size
        size: u64,
    },
}

/// Inline disk reference for small records near the file start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactDiskRef {
    partition: u32,
    file: u32,
    position: u32,
    total: u16,
    origin_len: u16,
    meta_end: u16,
    presence: Presence,
}

/// Out-of-line disk reference for large records or far offsets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WideDiskRef {
    partition: u32,
    file: u32,
    position: u64,
    total: u32,
    origin_len: u32,
    meta_end: u32,
    presence: Presence,
}

/// Locator of a record inside a partitioned block file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskRef {
    /// 16-bit size/offset fields
    Compact(CompactDiskRef),
    /// 32-bit size/offset fields, boxed to keep the enum small
    Wide(Box<WideDiskRef>),
}

impl DiskRef {
    /// Build the narrowest reference that can describe the record
    ///
    /// Presence is derived from the part lengths: a written part always has
    /// at least one byte.
    pub fn new(
        partition: u32,
        file: u32,
        position: u64,
        lengths: PartLengths,
    ) -> Result<DiskRef, ReferenceError> {
        let total = lengths.total();
        let presence = lengths.presence();
        let meta_end = lengths.origin_id + lengths.metadata;

        if total < COMPACT_SIZE_LIMIT && position < COMPACT_POSITION_LIMIT {
            return Ok(DiskRef::Compact(CompactDiskRef {
                partition,
                file,
                position: position as u32,
                total: total as u16,
                origin_len: lengths.origin_id as u16,
                meta_end: meta_end as u16,
                presence,
            }));
        }

        if total > u32::MAX as u64 {
            return Err(ReferenceError::RecordTooLarge { size: total });
        }

        Ok(DiskRef::Wide(Box::new(WideDiskRef {
            partition,
            file,
            position,
            total: total as u32,
            origin_len: lengths.origin_id as u32,
            meta_end: meta_end as u32,
            presence,
        })))
    }

    /// Partition (record type) the file belongs to
    pub fn partition(&self) -> u32 {
        match self {
            DiskRef::Compact(r) => r.partition,
            DiskRef::Wide(r) => r.partition,
        }
    }

    /// Insert-batch file within the partition
    pub fn insert_file_id(&self) -> u32 {
        match self {
            DiskRef::Compact(r) => r.file,
            DiskRef::Wide(r) => r.file,
        }
    }

    /// Byte offset of the record within its file
    pub fn position(&self) -> u64 {
        match self {
            DiskRef::Compact(r) => r.position as u64,
            DiskRef::Wide(r) => r.position,
        }
    }

    /// Total encoded size of the record
    pub fn total_size(&self) -> u64 {
        match self {
            DiskRef::Compact(r) => r.total as u64,
            DiskRef::Wide(r) => r.total as u64,
        }
    }

    /// Length of the origin id part
    pub fn origin_id_length(&self) -> u64 {
        match self {
            DiskRef::Compact(r) => r.origin_len as u64,
            DiskRef::Wide(r) => r.origin_len as u64,
        }
    }

    /// End offset of the metadata part (relative)
    pub fn metadata_end(&self) -> u64 {
        match self {
            DiskRef::Compact(r) => r.meta_end as u64,
            DiskRef::Wide(r) => r.meta_end as u64,
        }
    }

    /// Written parts
    pub fn presence(&self) -> Presence {
        match self {
            DiskRef::Compact(r) => r.presence,
            DiskRef::Wide(r) => r.presence,
        }
    }

    /// Whether the compact width was chosen
    pub fn is_compact(&self) -> bool {
        matches!(self, DiskRef::Compact(_))
    }

    /// Relative byte range of a part within the record
    pub fn range(&self, part: PayloadPart) -> Range<usize> {
        let origin_len = self.origin_id_length() as usize;
        let meta_end = self.metadata_end() as usize;
        let total = self.total_size() as usize;
        match part {
            PayloadPart::OriginId => 0..origin_len,
            PayloadPart::Metadata => origin_len..meta_end,
            PayloadPart::Geometry => meta_end..total,
        }
    }

    /// Size of a part in bytes (zero when not written)
    pub fn part_size(&self, part: PayloadPart) -> u64 {
        self.range(part).len() as u64
    }

    /// Absolute file range covering the record
    pub fn file_range(&self) -> Range<u64> {
        let start = self.position();
        start..start + self.total_size()
    }
}

/// Locator of a record in an external keyed registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryRef {
    external_id: u64,
    presence: Presence,
}

impl RegistryRef {
    /// Create a registry reference
    pub fn new(external_id: u64, presence: Presence) -> Self {
        Self {
            external_id,
            presence,
        }
    }

    /// Id of the object in the external registry
    pub fn external_id(&self) -> u64 {
        self.external_id
    }

    /// Written parts
    pub fn presence(&self) -> Presence {
        self.presence
    }
}

/// Secondary-store reference of any backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreRef {
    /// Record in a disk block file
    Disk(DiskRef),
    /// Record in an external registry
    Registry(RegistryRef),
}

impl StoreRef {
    /// Written parts
    pub fn presence(&self) -> Presence {
        match self {
            StoreRef::Disk(r) => r.presence(),
            StoreRef::Registry(r) => r.presence(),
        }
    }

    /// Disk locator, if this is a disk reference
    pub fn as_disk(&self) -> Option<&DiskRef> {
        match self {
            StoreRef::Disk(r) => Some(r),
            StoreRef::Registry(_) => None,
        }
    }

    /// Registry locator, if this is a registry reference
    pub fn as_registry(&self) -> Option<&RegistryRef> {
        match self {
            StoreRef::Registry(r) => Some(r),
            StoreRef::Disk(_) => None,
        }
    }
}

impl From<DiskRef> for StoreRef {
    fn from(r: DiskRef) -> Self {
        StoreRef::Disk(r)
    }
}

impl From<RegistryRef> for StoreRef {
    fn from(r: RegistryRef) -> Self {
        StoreRef::Registry(r)
    }
}
