//! Core types for the feature cache
//!
//! This crate defines the foundational types used throughout the system:
//! - RecordId: Monotonic cache-assigned record identifier
//! - TypeKey: Interned record-type key
//! - TimeSpan / VisualState: Always-resident descriptor fields
//! - MetadataValue / Geometry: Payload part types
//! - Payload / PartSet: Three-part evictable hot data
//! - RecordSchema: Named layout of a type's metadata array
//! - FeatureRecord: Decoded input element for insert
//! - Error: Error type hierarchy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod geometry;
pub mod payload;
pub mod record;
pub mod schema;
pub mod types;
pub mod value;

pub use error::{Error, Result};
pub use geometry::{BoundingBox, Coordinate, Geometry};
pub use payload::{PartSet, Payload, PayloadPart};
pub use record::FeatureRecord;
pub use schema::{FieldDescriptor, FieldKind, RecordSchema};
pub use types::{RecordId, TimeSpan, TypeKey, VisualState};
pub use value::MetadataValue;
