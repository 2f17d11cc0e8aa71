//! R-tree spatial index for Meridian.
//!
//! [`SpatialIndex`] is the public face: it keys opaque `u64` handles by
//! bounding box, normalizing antimeridian/pole-spanning boxes into
//! sub-rects at this boundary so the underlying [`rtree::RTree`] only ever
//! sees well-formed rectangles. A handle inserted under several sub-rects
//! is recorded as such, and searches deduplicate it.

mod index;
pub mod rtree;

pub use index::SpatialIndex;
