//! Metadata value types
//!
//! A record's metadata is an ordered list of [`MetadataValue`]s. The order is
//! defined by the record type's schema (see [`crate::schema`]); values carry
//! their own tag so the list is self-describing without the schema.
//!
//! ## Type Rules
//!
//! - No implicit coercions: `Int(1) != Float(1.0)`
//! - `Bytes` are not `Text`
//! - Float uses IEEE-754 equality: `NaN != NaN`, `-0.0 == 0.0`

use serde::{Deserialize, Serialize};

/// One typed metadata field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MetadataValue {
    /// Missing value
    Null,
    /// Boolean value
    Bool(bool),
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit floating point (IEEE-754)
    Float(f64),
    /// UTF-8 text
    Text(String),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Milliseconds since the Unix epoch
    Timestamp(i64),
}

impl PartialEq for MetadataValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (MetadataValue::Null, MetadataValue::Null) => true,
            (MetadataValue::Bool(a), MetadataValue::Bool(b)) => a == b,
            (MetadataValue::Int(a), MetadataValue::Int(b)) => a == b,
            (MetadataValue::Float(a), MetadataValue::Float(b)) => a == b,
            (MetadataValue::Text(a), MetadataValue::Text(b)) => a == b,
            (MetadataValue::Bytes(a), MetadataValue::Bytes(b)) => a == b,
            (MetadataValue::Timestamp(a), MetadataValue::Timestamp(b)) => a == b,
            _ => false,
        }
    }
}

impl MetadataValue {
    /// Type name as a string
    pub fn type_name(&self) -> &'static str {
        match self {
            MetadataValue::Null => "Null",
            MetadataValue::Bool(_) => "Bool",
            MetadataValue::Int(_) => "Int",
            MetadataValue::Float(_) => "Float",
            MetadataValue::Text(_) => "Text",
            MetadataValue::Bytes(_) => "Bytes",
            MetadataValue::Timestamp(_) => "Timestamp",
        }
    }

    /// Whether this is `Null`
    pub fn is_null(&self) -> bool {
        matches!(self, MetadataValue::Null)
    }

    /// Borrow as bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MetadataValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Borrow as i64
    pub fn as_int(&self) -> Option<i64> {
        match self {
            MetadataValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Borrow as f64
    pub fn as_float(&self) -> Option<f64> {
        match self {
            MetadataValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Borrow as str
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MetadataValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow as bytes
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            MetadataValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Timestamp value in ms
    pub fn as_timestamp(&self) -> Option<i64> {
        match self {
            MetadataValue::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    /// Approximate heap + inline footprint, used for memory accounting
    pub fn approx_size(&self) -> usize {
        let inline = std::mem::size_of::<MetadataValue>();
        match self {
            MetadataValue::Text(s) => inline + s.len(),
            MetadataValue::Bytes(b) => inline + b.len(),
            _ => inline,
        }
    }
}

impl From<bool> for MetadataValue {
    fn from(b: bool) -> Self {
        MetadataValue::Bool(b)
    }
}

impl From<i64> for MetadataValue {
    fn from(i: i64) -> Self {
        MetadataValue::Int(i)
    }
}

impl From<f64> for MetadataValue {
    fn from(f: f64) -> Self {
        MetadataValue::Float(f)
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::Text(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::Text(s)
    }
}

impl From<Vec<u8>> for MetadataValue {
    fn from(b: Vec<u8>) -> Self {
        MetadataValue::Bytes(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_cross_type_equality() {
        assert_ne!(MetadataValue::Int(1), MetadataValue::Float(1.0));
        assert_ne!(MetadataValue::Int(5), MetadataValue::Timestamp(5));
        assert_ne!(
            MetadataValue::Text("ab".into()),
            MetadataValue::Bytes(b"ab".to_vec())
        );
    }

    #[test]
    fn test_float_ieee_equality() {
        assert_ne!(MetadataValue::Float(f64::NAN), MetadataValue::Float(f64::NAN));
        assert_eq!(MetadataValue::Float(0.0), MetadataValue::Float(-0.0));
    }

    #[test]
    fn test_accessors() {
        assert_eq!(MetadataValue::from(true).as_bool(), Some(true));
        assert_eq!(MetadataValue::from(7i64).as_int(), Some(7));
        assert_eq!(MetadataValue::from("x").as_text(), Some("x"));
        assert_eq!(MetadataValue::Timestamp(9).as_timestamp(), Some(9));
        assert!(MetadataValue::Null.is_null());
        assert_eq!(MetadataValue::Int(1).as_text(), None);
    }

    #[test]
    fn test_bincode_roundtrip_keeps_tags() {
        let values = vec![
            MetadataValue::Null,
            MetadataValue::Int(-3),
            MetadataValue::Text("name".into()),
            MetadataValue::Timestamp(1_700_000_000_000),
        ];
        let bytes = bincode::serialize(&values).unwrap();
        let back: Vec<MetadataValue> = bincode::deserialize(&bytes).unwrap();
        assert_eq!(values, back);
    }

    #[test]
    fn test_approx_size_counts_heap() {
        let small = MetadataValue::Int(1).approx_size();
        let text = MetadataValue::Text("x".repeat(100)).approx_size();
        assert_eq!(text, small + 100);
    }
}
