//! Spherical points, polygons and area masks used by spatial filters.
//!
//! Point-in-polygon and polygon overlap tests are delegated to the `geo`
//! crate after normalizing longitudes into the polygon's frame; distances
//! use the haversine formula on the WGS84 authalic sphere.

use geo::{Area, BooleanOps, Contains, LineString, Point, Polygon};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Radius of the sphere with the same surface area as the WGS84 ellipsoid,
/// in metres.
pub const WGS84_SPHERE_RADIUS_M: f64 = 6_371_007.180_9;

/// A point on the sphere, in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SphericalPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl SphericalPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        SphericalPoint { latitude, longitude }
    }

    /// Great-circle distance to `other` in metres.
    pub fn distance_m(&self, other: &SphericalPoint) -> f64 {
        let lat_a = self.latitude.to_radians();
        let lat_b = other.latitude.to_radians();
        let d_lat = (other.latitude - self.latitude).to_radians();
        let d_lon = (other.longitude - self.longitude).to_radians();

        let h = (d_lat / 2.0).sin().powi(2)
            + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);
        2.0 * WGS84_SPHERE_RADIUS_M * h.sqrt().asin()
    }
}

/// A closed polygon on the sphere, stored as an open vertex ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SphericalPolygon {
    points: Vec<SphericalPoint>,
}

impl SphericalPolygon {
    pub fn new(points: Vec<SphericalPoint>) -> Result<Self> {
        if points.len() < 3 {
            return Err(PipelineError::invalid_argument(format!(
                "a polygon needs at least 3 vertices, got {}",
                points.len()
            )));
        }
        Ok(SphericalPolygon { points })
    }

    /// Build a polygon from parallel latitude/longitude vertex lists.
    /// Two entries are interpreted as opposite corners of a bounding box;
    /// a trailing vertex equal to the first is dropped.
    pub fn from_bounds(latitudes: &[f64], longitudes: &[f64]) -> Result<Self> {
        if latitudes.len() != longitudes.len() {
            return Err(PipelineError::invalid_argument(format!(
                "latitude bounds have {} entries but longitude bounds have {}",
                latitudes.len(),
                longitudes.len()
            )));
        }
        if latitudes.len() < 2 {
            return Err(PipelineError::invalid_argument(
                "bounds need at least 2 vertices",
            ));
        }
        if latitudes.len() == 2 {
            let (lat_a, lat_b) = (latitudes[0], latitudes[1]);
            let (lon_a, lon_b) = (longitudes[0], longitudes[1]);
            return SphericalPolygon::new(vec![
                SphericalPoint::new(lat_a, lon_a),
                SphericalPoint::new(lat_a, lon_b),
                SphericalPoint::new(lat_b, lon_b),
                SphericalPoint::new(lat_b, lon_a),
            ]);
        }

        let mut points: Vec<SphericalPoint> = latitudes
            .iter()
            .zip(longitudes)
            .map(|(&lat, &lon)| SphericalPoint::new(lat, lon))
            .collect();
        if points.len() > 3 && points.first() == points.last() {
            points.pop();
        }
        SphericalPolygon::new(points)
    }

    pub fn num_vertices(&self) -> usize {
        self.points.len()
    }

    pub fn vertices(&self) -> &[SphericalPoint] {
        &self.points
    }

    /// Reference longitude used to unwrap coordinates before planar tests.
    fn anchor_longitude(&self) -> f64 {
        self.points[0].longitude
    }

    fn to_geo(&self) -> Polygon<f64> {
        let anchor = self.anchor_longitude();
        let ring: Vec<(f64, f64)> = self
            .points
            .iter()
            .map(|p| (unwrap_longitude(p.longitude, anchor), p.latitude))
            .collect();
        Polygon::new(LineString::from(ring), vec![])
    }

    /// Whether the polygon contains the given point.
    pub fn contains_point(&self, point: &SphericalPoint) -> bool {
        let anchor = self.anchor_longitude();
        let geo_point = Point::new(unwrap_longitude(point.longitude, anchor), point.latitude);
        self.to_geo().contains(&geo_point)
    }

    /// Whether every vertex of `other` lies inside this polygon.
    pub fn covers(&self, other: &SphericalPolygon) -> bool {
        let polygon = self.to_geo();
        let anchor = self.anchor_longitude();
        other.points.iter().all(|p| {
            polygon.contains(&Point::new(
                unwrap_longitude(p.longitude, anchor),
                p.latitude,
            ))
        })
    }

    /// Fraction of this polygon's area overlapped by `other`, in [0, 1].
    pub fn overlap_fraction(&self, other: &SphericalPolygon) -> f64 {
        let own = self.to_geo();
        let area = own.unsigned_area();
        if area == 0.0 {
            return 0.0;
        }
        // Rebuild the other polygon in this polygon's longitude frame.
        let anchor = self.anchor_longitude();
        let ring: Vec<(f64, f64)> = other
            .points
            .iter()
            .map(|p| (unwrap_longitude(p.longitude, anchor), p.latitude))
            .collect();
        let other_geo = Polygon::new(LineString::from(ring), vec![]);
        own.intersection(&other_geo).unsigned_area() / area
    }

    pub fn intersects(&self, other: &SphericalPolygon) -> bool {
        self.overlap_fraction(other) > 0.0
            || other.points.iter().any(|p| self.contains_point(p))
            || self.points.iter().any(|p| other.contains_point(p))
    }
}

/// Map `longitude` into the 360-degree window centred on `anchor`.
fn unwrap_longitude(longitude: f64, anchor: f64) -> f64 {
    let mut lon = longitude;
    while lon < anchor - 180.0 {
        lon += 360.0;
    }
    while lon > anchor + 180.0 {
        lon -= 360.0;
    }
    lon
}

/// A set of polygons loaded from a file or built inline; spatial filters
/// test products against every member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaMask {
    polygons: Vec<SphericalPolygon>,
}

impl AreaMask {
    pub fn new(polygons: Vec<SphericalPolygon>) -> Result<Self> {
        if polygons.is_empty() {
            return Err(PipelineError::invalid_argument(
                "an area mask needs at least one polygon",
            ));
        }
        Ok(AreaMask { polygons })
    }

    pub fn single(polygon: SphericalPolygon) -> Self {
        AreaMask { polygons: vec![polygon] }
    }

    /// Parse an area mask file: one polygon per line, comma-separated
    /// alternating latitude,longitude vertex coordinates.
    pub fn parse(text: &str) -> Result<Self> {
        let mut polygons = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let values: Vec<f64> = line
                .split(',')
                .map(|field| {
                    field.trim().parse::<f64>().map_err(|_| {
                        PipelineError::invalid_argument(format!(
                            "invalid coordinate '{}' on line {}",
                            field.trim(),
                            line_no + 1
                        ))
                    })
                })
                .collect::<Result<_>>()?;
            if values.len() % 2 != 0 {
                return Err(PipelineError::invalid_argument(format!(
                    "line {} has an odd number of coordinates",
                    line_no + 1
                )));
            }
            let latitudes: Vec<f64> = values.iter().step_by(2).copied().collect();
            let longitudes: Vec<f64> = values.iter().skip(1).step_by(2).copied().collect();
            polygons.push(SphericalPolygon::from_bounds(&latitudes, &longitudes)?);
        }
        AreaMask::new(polygons)
    }

    pub fn polygons(&self) -> &[SphericalPolygon] {
        &self.polygons
    }

    pub fn any_contains_point(&self, point: &SphericalPoint) -> bool {
        self.polygons.iter().any(|p| p.contains_point(point))
    }

    pub fn any_covered_by(&self, area: &SphericalPolygon) -> bool {
        self.polygons.iter().any(|p| area.covers(p))
    }

    pub fn any_covers(&self, area: &SphericalPolygon) -> bool {
        self.polygons.iter().any(|p| p.covers(area))
    }

    pub fn any_intersects(&self, area: &SphericalPolygon, min_fraction: Option<f64>) -> bool {
        match min_fraction {
            Some(fraction) => self
                .polygons
                .iter()
                .any(|p| area.overlap_fraction(p).max(p.overlap_fraction(area)) >= fraction),
            None => self.polygons.iter().any(|p| p.intersects(area)),
        }
    }
}

/// Evaluate point containment for many points at once.
pub fn points_in_polygon(points: &[SphericalPoint], polygon: &SphericalPolygon) -> Vec<bool> {
    points
        .par_iter()
        .map(|p| polygon.contains_point(p))
        .collect()
}
