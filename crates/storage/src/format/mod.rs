//! On-disk byte formats for the disk store.
//!
//! This module centralizes all serialization logic for spilled payloads.
//! Keeping serialization separate from the operational logic (batching,
//! ledger, coalesced reads in the engine's disk assistant) makes format
//! evolution easier to manage.
//!
//! # Module Structure
//!
//! - `record`: per-record part encoding
//! - `block`: append-only block files and coalesced readers
//! - `layout`: session / partition / file directory naming

pub mod block;
pub mod layout;
pub mod record;

pub use block::{BlockReader, BlockWriter, ReadRequest};
pub use layout::{block_file_name, parse_block_file, parse_partition_dir, partition_dir_name, BlockLayout};
pub use record::{decode_record, encode_record, EncodedRecord, ORIGIN_ID_SIZE};

use crate::codec::CodecError;
use crate::reference::ReferenceError;

/// Errors encoding or decoding block records
#[derive(Debug, thiserror::Error)]
pub enum BlockFormatError {
    /// File I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// bincode failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cipher failed
    #[error("Cipher error: {0}")]
    Cipher(#[from] CodecError),

    /// Record shorter than its reference says
    #[error("Truncated record: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Size from the reference
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Record cannot be referenced
    #[error("Reference error: {0}")]
    Reference(#[from] ReferenceError),
}

impl From<bincode::Error> for BlockFormatError {
    fn from(e: bincode::Error) -> Self {
        BlockFormatError::Serialization(e.to_string())
    }
}

impl From<BlockFormatError> for geocache_core::Error {
    fn from(e: BlockFormatError) -> Self {
        match e {
            BlockFormatError::Io(e) => geocache_core::Error::IoError(e),
            BlockFormatError::Serialization(m) => geocache_core::Error::SerializationError(m),
            BlockFormatError::Cipher(e) => e.into(),
            BlockFormatError::Truncated { .. } => geocache_core::Error::Corruption(e.to_string()),
            BlockFormatError::Reference(e) => geocache_core::Error::InvalidArgument(e.to_string()),
        }
    }
}
