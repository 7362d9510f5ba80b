//! Record schemas
//!
//! Metadata is stored as a generic tagged-value array. A [`RecordSchema`]
//! names the positions of that array for one record type so callers can look
//! fields up by name. Schemas are descriptive only: a value whose tag does not
//! match its descriptor is still stored, [`RecordSchema::check`] reports it.

use serde::{Deserialize, Serialize};

use crate::value::MetadataValue;

/// Declared kind of a metadata field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    /// Boolean
    Bool,
    /// Integer
    Int,
    /// Floating point
    Float,
    /// Text
    Text,
    /// Raw bytes
    Bytes,
    /// Epoch milliseconds
    Timestamp,
    /// Any tag accepted
    Any,
}

impl FieldKind {
    /// Whether `value` is acceptable for this kind; `Null` always is
    pub fn accepts(&self, value: &MetadataValue) -> bool {
        matches!(
            (self, value),
            (_, MetadataValue::Null)
                | (FieldKind::Any, _)
                | (FieldKind::Bool, MetadataValue::Bool(_))
                | (FieldKind::Int, MetadataValue::Int(_))
                | (FieldKind::Float, MetadataValue::Float(_))
                | (FieldKind::Text, MetadataValue::Text(_))
                | (FieldKind::Bytes, MetadataValue::Bytes(_))
                | (FieldKind::Timestamp, MetadataValue::Timestamp(_))
        )
    }
}

/// One named metadata position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    /// Field name
    pub name: String,
    /// Declared kind
    pub kind: FieldKind,
}

impl FieldDescriptor {
    /// Create a descriptor
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Field layout of one record type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSchema {
    fields: Vec<FieldDescriptor>,
}

impl RecordSchema {
    /// Create a schema from ordered descriptors
    pub fn new(fields: Vec<FieldDescriptor>) -> Self {
        Self { fields }
    }

    /// Ordered descriptors
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the schema declares no fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Position of a field by name
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Positions whose value does not fit the declared kind, plus a trailing
    /// `len` entry when the arity differs
    pub fn check(&self, values: &[MetadataValue]) -> Vec<usize> {
        let mut bad: Vec<usize> = self
            .fields
            .iter()
            .zip(values)
            .enumerate()
            .filter(|(_, (f, v))| !f.kind.accepts(v))
            .map(|(i, _)| i)
            .collect();
        if values.len() != self.fields.len() {
            bad.push(values.len().min(self.fields.len()));
        }
        bad
    }
}
