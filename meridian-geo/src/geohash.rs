//! Geohash encode/decode.
//!
//! Standard base-32 geohash with interleaved longitude/latitude bits.
//! Precision is bounded at 22 characters (110 bits), past which f64
//! resolution is exhausted anyway.

use crate::bbox::BBox;
use crate::error::{GeoError, Result};

const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Maximum supported precision.
pub const MAX_PRECISION: usize = 22;

fn char_index(c: char) -> Result<usize> {
    let lc = c.to_ascii_lowercase() as u8;
    BASE32
        .iter()
        .position(|&b| b == lc)
        .ok_or(GeoError::InvalidGeohash(c))
}

/// Encode a position at the given precision (1..=22 characters).
pub fn encode(lat: f64, lon: f64, precision: usize) -> Result<String> {
    if precision == 0 || precision > MAX_PRECISION {
        return Err(GeoError::InvalidPrecision(precision));
    }
    let mut lat_range = (-90.0f64, 90.0f64);
    let mut lon_range = (-180.0f64, 180.0f64);
    let mut out = String::with_capacity(precision);
    let mut bit = 0u8;
    let mut ch = 0usize;
    let mut even = true; // longitude first

    while out.len() < precision {
        if even {
            let mid = (lon_range.0 + lon_range.1) / 2.0;
            if lon >= mid {
                ch = (ch << 1) | 1;
                lon_range.0 = mid;
            } else {
                ch <<= 1;
                lon_range.1 = mid;
            }
        } else {
            let mid = (lat_range.0 + lat_range.1) / 2.0;
            if lat >= mid {
                ch = (ch << 1) | 1;
                lat_range.0 = mid;
            } else {
                ch <<= 1;
                lat_range.1 = mid;
            }
        }
        even = !even;
        bit += 1;
        if bit == 5 {
            out.push(BASE32[ch] as char);
            bit = 0;
            ch = 0;
        }
    }
    Ok(out)
}

/// Bounding box covered by a geohash string.
pub fn bounds(hash: &str) -> Result<BBox> {
    if hash.is_empty() || hash.len() > MAX_PRECISION {
        return Err(GeoError::InvalidPrecision(hash.len()));
    }
    let mut lat_range = (-90.0f64, 90.0f64);
    let mut lon_range = (-180.0f64, 180.0f64);
    let mut even = true;

    for c in hash.chars() {
        let idx = char_index(c)?;
        for shift in (0..5).rev() {
            let bit = (idx >> shift) & 1;
            if even {
                let mid = (lon_range.0 + lon_range.1) / 2.0;
                if bit == 1 {
                    lon_range.0 = mid;
                } else {
                    lon_range.1 = mid;
                }
            } else {
                let mid = (lat_range.0 + lat_range.1) / 2.0;
                if bit == 1 {
                    lat_range.0 = mid;
                } else {
                    lat_range.1 = mid;
                }
            }
            even = !even;
        }
    }
    Ok(BBox::new(lat_range.0, lon_range.0, lat_range.1, lon_range.1))
}

/// Decode a geohash to its center position.
pub fn decode(hash: &str) -> Result<(f64, f64)> {
    let b = bounds(hash)?;
    Ok(b.center())
}
