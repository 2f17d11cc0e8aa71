//! Error types for meridian-geo.

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, GeoError>;

/// Geometry error type
#[derive(Error, Debug)]
pub enum GeoError {
    /// GeoJSON document could not be parsed into an object
    #[error("invalid geojson: {0}")]
    InvalidJson(String),

    /// A geohash string contained characters outside the base-32 alphabet
    #[error("invalid geohash character '{0}'")]
    InvalidGeohash(char),

    /// Geohash precision outside the supported 1..=22 range
    #[error("invalid geohash precision {0}")]
    InvalidPrecision(usize),

    /// A quadkey contained a digit other than 0-3
    #[error("invalid quadkey")]
    InvalidQuadKey,
}

impl GeoError {
    /// Create an invalid-geojson error
    pub fn invalid_json(msg: impl Into<String>) -> Self {
        GeoError::InvalidJson(msg.into())
    }
}
