//! Web-mercator tile and quadkey to bounding box.

use crate::bbox::BBox;
use crate::error::{GeoError, Result};

const MIN_LAT: f64 = -85.05112878;
const MAX_LAT: f64 = 85.05112878;

/// Bounding box of a web-mercator tile at `(x, y)` on detail level `z`.
pub fn tile_to_bounds(x: i64, y: i64, z: u32) -> BBox {
    let size = 1i64 << z.min(38);
    let min_lat = tile_y_to_lat(y + 1, size);
    let max_lat = tile_y_to_lat(y, size);
    let min_lon = tile_x_to_lon(x, size);
    let max_lon = tile_x_to_lon(x + 1, size);
    BBox::new(min_lat, min_lon, max_lat, max_lon)
}

fn tile_x_to_lon(x: i64, size: i64) -> f64 {
    (x as f64 / size as f64) * 360.0 - 180.0
}

fn tile_y_to_lat(y: i64, size: i64) -> f64 {
    let n = std::f64::consts::PI - 2.0 * std::f64::consts::PI * y as f64 / size as f64;
    let lat = (0.5 * (n.exp() - (-n).exp())).atan().to_degrees();
    lat.clamp(MIN_LAT, MAX_LAT)
}

/// Bounding box of a quadkey string (each character is a 0-3 quadrant digit).
pub fn quadkey_to_bounds(quadkey: &str) -> Result<BBox> {
    let mut x = 0i64;
    let mut y = 0i64;
    for c in quadkey.chars() {
        x <<= 1;
        y <<= 1;
        match c {
            '0' => {}
            '1' => x |= 1,
            '2' => y |= 1,
            '3' => {
                x |= 1;
                y |= 1;
            }
            _ => return Err(GeoError::InvalidQuadKey),
        }
    }
    Ok(tile_to_bounds(x, y, quadkey.len() as u32))
}
