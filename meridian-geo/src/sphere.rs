//! Spherical-earth distance helpers.

use crate::bbox::BBox;

/// Mean earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance between two positions in meters.
///
/// Uses a spherical earth approximation; accuracy is ~0.3% for practical
/// distances.
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_r = lat1.to_radians();
    let lat2_r = lat2.to_radians();
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1_r.cos() * lat2_r.cos() * (dlon / 2.0).sin().powi(2);

    EARTH_RADIUS_M * 2.0 * a.sqrt().asin()
}

/// Bounding box covering a circle of `meters` radius around a center.
///
/// The longitude delta widens with latitude; at the poles it degenerates to
/// the full longitude range. The returned box may exceed `[-180,180]` and
/// is expected to go through [`BBox::normalize`] before reaching the index.
pub fn bbox_from_center(lat: f64, lon: f64, meters: f64) -> BBox {
    let lat_delta = (meters / EARTH_RADIUS_M).to_degrees();
    let cos_lat = lat.to_radians().cos().abs();
    let lon_delta = if cos_lat < 1e-9 {
        180.0
    } else {
        (meters / (EARTH_RADIUS_M * cos_lat)).to_degrees()
    };
    BBox::new(
        lat - lat_delta,
        lon - lon_delta,
        lat + lat_delta,
        lon + lon_delta,
    )
}

/// Approximate distance in meters from a position to a great-circle
/// segment, using a local equirectangular projection around the
/// position. Accurate for the segment lengths geofence movements
/// produce.
pub fn point_to_segment_distance(
    lat: f64,
    lon: f64,
    lat1: f64,
    lon1: f64,
    lat2: f64,
    lon2: f64,
) -> f64 {
    const M_PER_DEG: f64 = 111_195.0;
    let kx = lat.to_radians().cos();
    let x1 = (lon1 - lon) * kx;
    let y1 = lat1 - lat;
    let x2 = (lon2 - lon) * kx;
    let y2 = lat2 - lat;
    let dx = x2 - x1;
    let dy = y2 - y1;
    let t = if dx == 0.0 && dy == 0.0 {
        0.0
    } else {
        (-(x1 * dx + y1 * dy) / (dx * dx + dy * dy)).clamp(0.0, 1.0)
    };
    let cx = x1 + t * dx;
    let cy = y1 + t * dy;
    (cx * cx + cy * cy).sqrt() * M_PER_DEG
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_distance_midpoint_pass() {
        // A segment passing straight through the position.
        let d = point_to_segment_distance(33.0, -115.0, 32.0, -115.0, 34.0, -115.0);
        assert!(d < 1.0, "got {d}");
        // Both endpoints far east: nearest point is an endpoint.
        let d = point_to_segment_distance(0.0, 0.0, 0.0, 1.0, 0.0, 2.0);
        assert!((d - 111_195.0).abs() < 1_000.0, "got {d}");
        // Degenerate segment.
        let d = point_to_segment_distance(0.0, 0.0, 0.5, 0.0, 0.5, 0.0);
        assert!((d - 55_597.0).abs() < 1_000.0, "got {d}");
    }

    #[test]
    fn haversine_known_distances() {
        // Same point
        assert!(haversine_distance(0.0, 0.0, 0.0, 0.0).abs() < 0.001);

        // Paris to London: ~343 km
        let d = haversine_distance(48.8566, 2.3522, 51.5074, -0.1278);
        assert!((d - 343_500.0).abs() < 5_000.0);

        // One degree of longitude at the equator: ~111 km
        let d = haversine_distance(0.0, 0.0, 0.0, 1.0);
        assert!((d - 111_195.0).abs() < 500.0);
    }

    #[test]
    fn center_bbox_contains_radius() {
        let b = bbox_from_center(33.5, -112.1, 5000.0);
        assert!(b.contains_point(33.5, -112.1));
        // Points just inside the radius fall inside the box.
        assert!(b.contains_point(33.5 + 0.04, -112.1));
        assert!(b.contains_point(33.5, -112.1 + 0.05));
    }

    #[test]
    fn center_bbox_widens_near_poles() {
        let eq = bbox_from_center(0.0, 0.0, 10_000.0);
        let hi = bbox_from_center(80.0, 0.0, 10_000.0);
        assert!(hi.max_lon - hi.min_lon > eq.max_lon - eq.min_lon);
    }
}
