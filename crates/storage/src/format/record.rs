//! Record encoding
//!
//! A record is three consecutive byte ranges with no framing of their own:
//!
//! ```text
//! +-----------------+ 0
//! | origin id       | 8 bytes LE, never ciphered (omitted when null)
//! +-----------------+ origin_len
//! | metadata        | bincode Vec<MetadataValue>, then cipher (omitted when null)
//! +-----------------+ meta_end
//! | geometry        | bincode Geometry, then cipher (omitted when null)
//! +-----------------+ total
//! ```
//!
//! Part boundaries are only recoverable through the [`DiskRef`] built from
//! the [`PartLengths`] returned by [`encode_record`].

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use geocache_core::{Geometry, MetadataValue, PartSet, Payload, PayloadPart};
use std::sync::Arc;

use super::BlockFormatError;
use crate::codec::PartCipher;
use crate::reference::{DiskRef, PartLengths};

/// Size of an encoded origin id
pub const ORIGIN_ID_SIZE: u64 = 8;

/// Encoded record bytes with their part lengths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedRecord {
    /// Concatenated parts
    pub bytes: Vec<u8>,
    /// Length of each part
    pub lengths: PartLengths,
}

/// Encode the non-null parts of a payload
pub fn encode_record(
    payload: &Payload,
    cipher: Option<&dyn PartCipher>,
) -> Result<EncodedRecord, BlockFormatError> {
    let mut bytes = Vec::new();
    let mut lengths = PartLengths::default();

    if let Some(origin_id) = payload.origin_id {
        bytes.write_u64::<LittleEndian>(origin_id)?;
        lengths.origin_id = ORIGIN_ID_SIZE;
    }

    if let Some(metadata) = &payload.metadata {
        let encoded = seal(bincode::serialize(&**metadata)?, cipher)?;
        lengths.metadata = encoded.len() as u64;
        bytes.extend_from_slice(&encoded);
    }

    if let Some(geometry) = &payload.geometry {
        let encoded = seal(bincode::serialize(&**geometry)?, cipher)?;
        lengths.geometry = encoded.len() as u64;
        bytes.extend_from_slice(&encoded);
    }

    Ok(EncodedRecord { bytes, lengths })
}

/// Decode the requested parts of a record
///
/// `record` holds the whole record (`disk_ref.total_size()` bytes). Parts not
/// requested or not present in the reference decode to null.
pub fn decode_record(
    record: &[u8],
    disk_ref: &DiskRef,
    wanted: PartSet,
    cipher: Option<&dyn PartCipher>,
) -> Result<Payload, BlockFormatError> {
    let total = disk_ref.total_size() as usize;
    if record.len() < total {
        return Err(BlockFormatError::Truncated {
            expected: total,
            actual: record.len(),
        });
    }

    let presence = disk_ref.presence();
    let readable = wanted.intersection(presence.parts());
    let mut payload = Payload::empty();

    for part in readable.iter() {
        let range = disk_ref.range(part);
        let bytes = &record[range];
        match part {
            PayloadPart::OriginId => {
                let mut cursor = bytes;
                payload.origin_id = Some(cursor.read_u64::<LittleEndian>()?);
            }
            PayloadPart::Metadata => {
                let plain = open(bytes, cipher)?;
                let values: Vec<MetadataValue> = bincode::deserialize(&plain)?;
                payload.metadata = Some(Arc::from(values));
            }
            PayloadPart::Geometry => {
                let plain = open(bytes, cipher)?;
                let geometry: Geometry = bincode::deserialize(&plain)?;
                payload.geometry = Some(Arc::new(geometry));
            }
        }
    }

    Ok(payload)
}

fn seal(plain: Vec<u8>, cipher: Option<&dyn PartCipher>) -> Result<Vec<u8>, BlockFormatError> {
    match cipher {
        Some(c) => Ok(c.encrypt(&plain)?),
        None => Ok(plain),
    }
}

fn open(sealed: &[u8], cipher: Option<&dyn PartCipher>) -> Result<Vec<u8>, BlockFormatError> {
    match cipher {
        Some(c) => Ok(c.decrypt(sealed)?),
        None => Ok(sealed.to_vec()),
    }
}
