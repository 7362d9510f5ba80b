//! Core types for the feature cache
//!
//! This module defines the foundational descriptor types:
//! - RecordId: Cache-assigned identifier for one feature record
//! - TypeKey: Interned record-type name (category + source)
//! - TimeSpan: Start/end time of a record
//! - VisualState: Small flag/attribute bundle used by display consumers

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

/// Identifier of one cached feature record
///
/// Ids are minted by the cache from a single monotonic counter and are never
/// reused. [`RecordId::FILTERED`] is returned by insert for records that a
/// load filter rejected; it never appears in the index or the entry map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(u64);

impl RecordId {
    /// Sentinel for records rejected at insert time
    pub const FILTERED: RecordId = RecordId(u64::MAX);

    /// Wrap a raw id value
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw id value
    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Whether this is the load-filter sentinel
    #[inline]
    pub const fn is_filtered(&self) -> bool {
        self.0 == u64::MAX
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_filtered() {
            write!(f, "filtered")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<u64> for RecordId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Interned record-type key
///
/// A TypeKey is a shared string. Every entry of a type holds a clone of the
/// same `Arc<str>`, so millions of entries cost one pointer each rather than
/// one string each. Interning happens in the storage crate's type registry;
/// two keys built independently from the same text still compare equal.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeKey(Arc<str>);

impl TypeKey {
    /// Separator between category and source in a composed key
    pub const SEPARATOR: char = '/';

    /// Create a key from its full text (not interned)
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// Compose the canonical name for a `(category, source)` pair
    pub fn compose(category: &str, source: &str) -> String {
        format!("{}{}{}", category, Self::SEPARATOR, source)
    }

    /// Full key text
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Category part (text before the first separator)
    pub fn category(&self) -> &str {
        self.0
            .split_once(Self::SEPARATOR)
            .map(|(c, _)| c)
            .unwrap_or(&self.0)
    }

    /// Source part (text after the first separator), empty when absent
    pub fn source(&self) -> &str {
        self.0
            .split_once(Self::SEPARATOR)
            .map(|(_, s)| s)
            .unwrap_or("")
    }

    /// Whether two keys share the same allocation
    pub fn ptr_eq(&self, other: &TypeKey) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeKey({:?})", &*self.0)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for TypeKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TypeKey {
    fn from(s: &str) -> Self {
        TypeKey::new(s)
    }
}

/// Start/end time of a record, in milliseconds since the Unix epoch
///
/// Both bounds are inclusive. `TimeSpan::ALL` is used for timeless records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeSpan {
    start: i64,
    end: i64,
}

impl TimeSpan {
    /// Span covering all representable times
    pub const ALL: TimeSpan = TimeSpan {
        start: i64::MIN,
        end: i64::MAX,
    };

    /// Create a span; bounds are swapped if given in reverse order
    pub fn new(start: i64, end: i64) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    /// Zero-length span at a single instant
    pub fn instant(at: i64) -> Self {
        Self { start: at, end: at }
    }

    /// Build from chrono timestamps
    pub fn from_datetimes(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self::new(start.timestamp_millis(), end.timestamp_millis())
    }

    /// Start bound (ms)
    #[inline]
    pub fn start(&self) -> i64 {
        self.start
    }

    /// End bound (ms)
    #[inline]
    pub fn end(&self) -> i64 {
        self.end
    }

    /// Start as a chrono timestamp, `None` when out of chrono's range
    pub fn start_datetime(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.start).single()
    }

    /// End as a chrono timestamp, `None` when out of chrono's range
    pub fn end_datetime(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.end).single()
    }

    /// Whether this span is unbounded on both sides
    pub fn is_timeless(&self) -> bool {
        *self == Self::ALL
    }

    /// Closed-interval overlap test
    #[inline]
    pub fn intersects(&self, other: &TimeSpan) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Whether `at` falls inside the span
    pub fn contains(&self, at: i64) -> bool {
        self.start <= at && at <= self.end
    }
}

impl Default for TimeSpan {
    fn default() -> Self {
        Self::ALL
    }
}

/// Display-side state kept on every entry
///
/// Packed into five bytes: a flag byte and an RGBA color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VisualState {
    flags: u8,
    color: u32,
}

impl VisualState {
    /// Record is drawn
    pub const VISIBLE: u8 = 0b0000_0001;
    /// Record is selected by the user
    pub const SELECTED: u8 = 0b0000_0010;
    /// Record is highlighted (hover, search hit)
    pub const HIGHLIGHTED: u8 = 0b0000_0100;
    /// Record is hidden by a filter rather than by the user
    pub const FILTERED_OUT: u8 = 0b0000_1000;

    /// Default opaque white
    pub const DEFAULT_COLOR: u32 = 0xFFFF_FFFF;

    /// Visible, default color
    pub fn new() -> Self {
        Self {
            flags: Self::VISIBLE,
            color: Self::DEFAULT_COLOR,
        }
    }

    /// Build from raw parts
    pub fn from_parts(flags: u8, color: u32) -> Self {
        Self { flags, color }
    }

    /// Raw flag byte
    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// RGBA color
    pub fn color(&self) -> u32 {
        self.color
    }

    /// Test a flag
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag == flag
    }

    /// Copy with a flag set or cleared
    pub fn with_flag(mut self, flag: u8, on: bool) -> Self {
        if on {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
        self
    }

    /// Copy with a new color
    pub fn with_color(mut self, color: u32) -> Self {
        self.color = color;
        self
    }

    /// Shorthand for the VISIBLE flag
    pub fn is_visible(&self) -> bool {
        self.has(Self::VISIBLE)
    }
}

impl Default for VisualState {
    fn default() -> Self {
        Self::new()
    }
}
