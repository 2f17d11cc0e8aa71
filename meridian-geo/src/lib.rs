//! Geometry model and spatial predicates for Meridian.
//!
//! This crate owns everything the database needs to reason about shapes:
//!
//! - [`Object`]: the tagged geometry value stored per id (points, bounding
//!   boxes, full GeoJSON geometries, features, and opaque strings)
//! - [`BBox`]: axis-aligned lat/lon bounding boxes, including antimeridian
//!   and pole normalization for the spatial index
//! - [`sphere`]: haversine distance and radius-derived bounding boxes
//! - [`geohash`]: geohash encode/decode/bounds
//! - [`tile`]: web-mercator tile and quadkey to bounding box
//!
//! Exact predicates (`within`, `intersects`) are delegated to the `geo`
//! crate; `nearby` uses spherical-earth haversine distance.

pub mod bbox;
pub mod error;
pub mod geohash;
pub mod object;
pub mod sphere;
pub mod tile;

mod predicates;

pub use bbox::BBox;
pub use error::{GeoError, Result};
pub use object::{GeoPoint, Object};
