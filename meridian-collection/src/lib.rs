//! Keyed object collections for Meridian.
//!
//! A [`Collection`] stores identified objects for one database key: a
//! primary ordered id index, an item arena, one spatial index over the
//! geometric objects, and a field-name-to-slot table shared by every item.

mod arena;
mod collection;

pub use collection::{Collection, FieldValue, Visit};
