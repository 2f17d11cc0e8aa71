//! Axis-aligned lat/lon bounding boxes.
//!
//! The spatial index only understands rectangles whose coordinates lie
//! inside `[-180,180] x [-90,90]`. A query or object box may legitimately
//! wrap the antimeridian (negative longitude span) or spill over a pole;
//! [`BBox::normalize`] splits such a box into 1..4 well-formed sub-rects
//! so the index sees the union.

use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl BBox {
    /// Create a new bounding box.
    pub fn new(min_lat: f64, min_lon: f64, max_lat: f64, max_lon: f64) -> Self {
        Self {
            min_lat,
            min_lon,
            max_lat,
            max_lon,
        }
    }

    /// The world box.
    pub fn world() -> Self {
        Self::new(-90.0, -180.0, 90.0, 180.0)
    }

    /// A degenerate box at a single position.
    pub fn point(lat: f64, lon: f64) -> Self {
        Self::new(lat, lon, lat, lon)
    }

    /// Center position of the box.
    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lon + self.max_lon) / 2.0,
        )
    }

    /// Grow this box to cover `other`.
    pub fn expand(&mut self, other: &BBox) {
        if other.min_lat < self.min_lat {
            self.min_lat = other.min_lat;
        }
        if other.min_lon < self.min_lon {
            self.min_lon = other.min_lon;
        }
        if other.max_lat > self.max_lat {
            self.max_lat = other.max_lat;
        }
        if other.max_lon > self.max_lon {
            self.max_lon = other.max_lon;
        }
    }

    /// Check if this box intersects another.
    pub fn intersects(&self, other: &BBox) -> bool {
        self.min_lat <= other.max_lat
            && self.max_lat >= other.min_lat
            && self.min_lon <= other.max_lon
            && self.max_lon >= other.min_lon
    }

    /// Check if this box fully contains another.
    pub fn contains_bbox(&self, other: &BBox) -> bool {
        self.min_lat <= other.min_lat
            && self.max_lat >= other.max_lat
            && self.min_lon <= other.min_lon
            && self.max_lon >= other.max_lon
    }

    /// Check if a position lies inside the box.
    pub fn contains_point(&self, lat: f64, lon: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lon >= self.min_lon && lon <= self.max_lon
    }

    /// Whether the longitude span is negative, i.e. the box wraps the
    /// antimeridian.
    pub fn wraps_antimeridian(&self) -> bool {
        self.min_lon > self.max_lon
    }

    /// Split into 1..4 sub-rects with all coordinates in
    /// `[-180,180] x [-90,90]`.
    ///
    /// Longitude handling: a negative span (`min_lon > max_lon`) or a bound
    /// outside `[-180,180]` splits the box at the antimeridian. Latitude
    /// handling: the portion spilling past a pole is folded onto the
    /// opposite hemisphere with longitudes rotated 180 degrees, which may
    /// itself split at the antimeridian.
    pub fn normalize(&self) -> Vec<BBox> {
        let mut out = Vec::with_capacity(2);

        // Latitude: clamp the direct portion, fold any polar overflow.
        let lat_spans = split_lat(self.min_lat, self.max_lat);

        for (min_lat, max_lat, rotated) in lat_spans {
            let (min_lon, max_lon) = if rotated {
                (self.min_lon + 180.0, self.max_lon + 180.0)
            } else {
                (self.min_lon, self.max_lon)
            };
            for (lo, hi) in split_lon(min_lon, max_lon) {
                out.push(BBox::new(min_lat, lo, max_lat, hi));
            }
        }
        out
    }
}

/// Split a latitude span into the in-range portion plus at most one folded
/// polar portion. The bool marks a fold (longitudes rotate 180 degrees).
fn split_lat(min: f64, max: f64) -> Vec<(f64, f64, bool)> {
    let mut spans = Vec::with_capacity(2);
    let clamped_min = min.max(-90.0);
    let clamped_max = max.min(90.0);
    if clamped_min <= clamped_max {
        spans.push((clamped_min, clamped_max, false));
    }
    if max > 90.0 {
        // Overflow past the north pole folds back southward.
        spans.push((180.0 - max.min(270.0), 90.0, true));
    }
    if min < -90.0 {
        spans.push((-90.0, -180.0 - min.max(-270.0), true));
    }
    spans
}

/// Split a longitude span into 1..2 in-range spans.
fn split_lon(min: f64, max: f64) -> Vec<(f64, f64)> {
    // Entire world once the span covers 360 degrees.
    if max - min >= 360.0 {
        return vec![(-180.0, 180.0)];
    }
    let min = wrap_lon(min);
    let max = wrap_lon(max);
    if min > max {
        vec![(min, 180.0), (-180.0, max)]
    } else {
        vec![(min, max)]
    }
}

fn wrap_lon(lon: f64) -> f64 {
    if (-180.0..=180.0).contains(&lon) {
        return lon;
    }
    let mut lon = (lon + 180.0) % 360.0;
    if lon < 0.0 {
        lon += 360.0;
    }
    lon - 180.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_plain_box_is_identity() {
        let b = BBox::new(10.0, 20.0, 30.0, 40.0);
        assert_eq!(b.normalize(), vec![b]);
    }

    #[test]
    fn normalize_splits_antimeridian_wrap() {
        // Negative longitude span wraps the antimeridian.
        let b = BBox::new(-10.0, 170.0, 10.0, -170.0);
        let parts = b.normalize();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], BBox::new(-10.0, 170.0, 10.0, 180.0));
        assert_eq!(parts[1], BBox::new(-10.0, -180.0, 10.0, -170.0));
    }

    #[test]
    fn normalize_splits_out_of_range_longitude() {
        let b = BBox::new(0.0, 175.0, 5.0, 185.0);
        let parts = b.normalize();
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|p| p.min_lon >= -180.0 && p.max_lon <= 180.0));
    }

    #[test]
    fn normalize_folds_over_north_pole() {
        let b = BBox::new(80.0, -10.0, 100.0, 10.0);
        let parts = b.normalize();
        // Direct portion clipped at the pole plus a folded portion on the
        // far side of the globe.
        assert!(parts.len() >= 2);
        assert!(parts.iter().all(|p| p.max_lat <= 90.0 && p.min_lat >= -90.0));
        assert!(parts.contains(&BBox::new(80.0, -10.0, 90.0, 10.0)));
    }

    #[test]
    fn normalize_never_exceeds_four() {
        let b = BBox::new(80.0, 170.0, 100.0, 190.0);
        let parts = b.normalize();
        assert!(parts.len() <= 4, "got {} parts", parts.len());
    }

    #[test]
    fn intersects_and_contains() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(5.0, 5.0, 15.0, 15.0);
        assert!(a.intersects(&b));
        assert!(!a.contains_bbox(&b));
        assert!(a.contains_bbox(&BBox::new(1.0, 1.0, 9.0, 9.0)));
        assert!(a.contains_point(0.0, 10.0));
        assert!(!a.contains_point(-0.1, 5.0));
    }
}
