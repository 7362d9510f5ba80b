//! Geometry model
//!
//! The cache treats geometry as an opaque shape object: it stores, spills and
//! reloads it, but never interprets it beyond a bounding box. Coordinates are
//! longitude/latitude in degrees with an optional altitude in meters.

use serde::{Deserialize, Serialize};

/// One position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    /// Longitude in degrees
    pub lon: f64,
    /// Latitude in degrees
    pub lat: f64,
    /// Altitude in meters, when known
    pub alt: Option<f64>,
}

impl Coordinate {
    /// 2D coordinate
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat, alt: None }
    }

    /// 3D coordinate
    pub fn with_alt(lon: f64, lat: f64, alt: f64) -> Self {
        Self {
            lon,
            lat,
            alt: Some(alt),
        }
    }
}

/// Axis-aligned lon/lat box
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Western bound
    pub min_lon: f64,
    /// Southern bound
    pub min_lat: f64,
    /// Eastern bound
    pub max_lon: f64,
    /// Northern bound
    pub max_lat: f64,
}

impl BoundingBox {
    fn around(c: &Coordinate) -> Self {
        Self {
            min_lon: c.lon,
            min_lat: c.lat,
            max_lon: c.lon,
            max_lat: c.lat,
        }
    }

    fn extend(&mut self, c: &Coordinate) {
        self.min_lon = self.min_lon.min(c.lon);
        self.min_lat = self.min_lat.min(c.lat);
        self.max_lon = self.max_lon.max(c.lon);
        self.max_lat = self.max_lat.max(c.lat);
    }

    /// Whether two boxes overlap (edges inclusive)
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_lon <= other.max_lon
            && other.min_lon <= self.max_lon
            && self.min_lat <= other.max_lat
            && other.min_lat <= self.max_lat
    }
}

/// Shape attached to a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Geometry {
    /// Single position
    Point(Coordinate),
    /// Unconnected positions
    MultiPoint(Vec<Coordinate>),
    /// Polyline
    LineString(Vec<Coordinate>),
    /// Several polylines
    MultiLineString(Vec<Vec<Coordinate>>),
    /// Polygon with optional holes
    Polygon {
        /// Outer ring
        exterior: Vec<Coordinate>,
        /// Inner rings
        holes: Vec<Vec<Coordinate>>,
    },
    /// Heterogeneous collection
    Collection(Vec<Geometry>),
}

impl Geometry {
    /// Bounding box of all coordinates, `None` for empty shapes
    pub fn bounding_box(&self) -> Option<BoundingBox> {
        let mut bbox: Option<BoundingBox> = None;
        self.visit(&mut |c| {
            if let Some(b) = bbox.as_mut() {
                b.extend(c);
                return;
            }
            bbox = Some(BoundingBox::around(c));
        });
        bbox
    }

    fn visit(&self, f: &mut dyn FnMut(&Coordinate)) {
        match self {
            Geometry::Point(c) => f(c),
            Geometry::MultiPoint(cs) | Geometry::LineString(cs) => cs.iter().for_each(|c| f(c)),
            Geometry::MultiLineString(lines) => lines.iter().flatten().for_each(|c| f(c)),
            Geometry::Polygon { exterior, holes } => {
                exterior.iter().chain(holes.iter().flatten()).for_each(|c| f(c))
            }
            Geometry::Collection(parts) => parts.iter().for_each(|p| p.visit(f)),
        }
    }

    /// Total number of coordinates
    pub fn coordinate_count(&self) -> usize {
        match self {
            Geometry::Point(_) => 1,
            Geometry::MultiPoint(cs) | Geometry::LineString(cs) => cs.len(),
            Geometry::MultiLineString(lines) => lines.iter().map(Vec::len).sum(),
            Geometry::Polygon { exterior, holes } => {
                exterior.len() + holes.iter().map(Vec::len).sum::<usize>()
            }
            Geometry::Collection(parts) => parts.iter().map(Geometry::coordinate_count).sum(),
        }
    }
}
