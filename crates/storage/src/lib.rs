//! Storage layer for the feature cache
//!
//! This crate implements the in-memory tier and the on-disk formats:
//! - RecordIndex: TypeKey → ordered id sets, plus the IdAllocator
//! - CacheRegistry: explicitly owned type interner, partitions and schemas
//! - CacheEntry / EntryMap: DashMap of always-resident descriptors
//! - StoreRef: compact/wide disk references and registry references
//! - codec: cipher seam for metadata and geometry parts
//! - format: block-file record encoding, writers, readers and layout
//!
//! # Concurrency
//!
//! - Entry lookups never block each other (DashMap with Fx hashing)
//! - Each entry guards its payload slot with its own small mutex
//! - Id allocation is a single atomic increment

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod entries;
pub mod entry;
pub mod format;
pub mod index;
pub mod reference;
pub mod registry;

pub use codec::{session_cipher, CipherFactory, CodecError, IdentityCipher, PartCipher, SharedCipher};
pub use entries::{EntryMap, EvictionCandidate, EvictionScan};
pub use entry::{CacheEntry, EntryDescriptor, Residency, Retired};
pub use format::BlockFormatError;
pub use index::{IdAllocator, RecordIndex};
pub use reference::{
    DiskRef, PartLengths, Presence, ReferenceError, RegistryRef, StoreRef, COMPACT_POSITION_LIMIT,
    COMPACT_SIZE_LIMIT,
};
pub use registry::CacheRegistry;
