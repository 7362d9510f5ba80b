//! Input records
//!
//! [`FeatureRecord`] is the decoded element handed to the cache at insert
//! time. Parsing source formats into records happens outside the cache.

use crate::geometry::Geometry;
use crate::payload::Payload;
use crate::types::{TimeSpan, VisualState};
use crate::value::MetadataValue;

/// One decoded feature ready for insert
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureRecord {
    /// Validity interval of the feature
    pub time_span: TimeSpan,
    /// Initial display state
    pub visual_state: VisualState,
    /// Id of the feature in its source, when the source has one
    pub origin_id: Option<u64>,
    /// Metadata fields
    pub metadata: Option<Vec<MetadataValue>>,
    /// Shape
    pub geometry: Option<Geometry>,
}

impl FeatureRecord {
    /// Record with only a time span; fill the rest with the `with_*` builders
    pub fn new(time_span: TimeSpan) -> Self {
        Self {
            time_span,
            ..Self::default()
        }
    }

    /// Set the origin id
    pub fn with_origin_id(mut self, id: u64) -> Self {
        self.origin_id = Some(id);
        self
    }

    /// Set metadata
    pub fn with_metadata(mut self, metadata: Vec<MetadataValue>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Set geometry
    pub fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = Some(geometry);
        self
    }

    /// Set display state
    pub fn with_visual_state(mut self, state: VisualState) -> Self {
        self.visual_state = state;
        self
    }

    /// Split off the payload, leaving the descriptor fields behind
    pub fn into_payload(self) -> (TimeSpan, VisualState, Payload) {
        let payload = Payload::new(self.origin_id, self.metadata, self.geometry);
        (self.time_span, self.visual_state, payload)
    }
}
