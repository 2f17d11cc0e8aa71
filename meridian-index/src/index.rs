//! Normalizing index wrapper.
//!
//! Object and query boxes may wrap the antimeridian or spill over a pole;
//! they are split into well-formed sub-rects here, at the index boundary.
//! A handle stored under more than one sub-rect is tracked in `multi` so
//! searches can deduplicate it, and removal cleans up every sub-rect.

use std::collections::{HashMap, HashSet};

use meridian_geo::BBox;

use crate::rtree::RTree;

/// Spatial index of opaque `u64` handles keyed by bounding box.
#[derive(Debug, Default)]
pub struct SpatialIndex {
    tree: RTree,
    /// Handles inserted under multiple normalized sub-rects.
    multi: HashMap<u64, usize>,
    /// Number of distinct handles.
    handles: usize,
}

impl SpatialIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct handles in the index.
    pub fn len(&self) -> usize {
        self.handles
    }

    pub fn is_empty(&self) -> bool {
        self.handles == 0
    }

    /// Union of all stored rects; `None` when empty.
    pub fn bounds(&self) -> Option<BBox> {
        self.tree.bounds()
    }

    /// Insert `handle` under the normalized sub-rects of `bbox`.
    pub fn insert(&mut self, bbox: &BBox, handle: u64) {
        let rects = bbox.normalize();
        if rects.len() > 1 {
            self.multi.insert(handle, rects.len());
        }
        for r in rects {
            self.tree.insert(r, handle);
        }
        self.handles += 1;
    }

    /// Remove every entry stored for `handle` under `bbox`.
    ///
    /// The caller passes the same (unnormalized) box it inserted with.
    pub fn remove(&mut self, bbox: &BBox, handle: u64) -> bool {
        let rects = bbox.normalize();
        let mut removed = false;
        for r in &rects {
            removed |= self.tree.remove(*r, handle);
        }
        if removed {
            self.multi.remove(&handle);
            self.handles -= 1;
        }
        removed
    }

    /// Visit every handle whose stored box intersects `bbox`, deduplicating
    /// handles stored under several sub-rects. Returns false when `visit`
    /// stopped the walk early.
    pub fn search(&self, bbox: &BBox, visit: &mut dyn FnMut(u64) -> bool) -> bool {
        let queries = bbox.normalize();
        let mut seen: HashSet<u64> = HashSet::new();
        for q in &queries {
            let completed = self.tree.search(q, &mut |entry| {
                let may_dup = queries.len() > 1 || self.multi.contains_key(&entry.handle);
                if may_dup && !seen.insert(entry.handle) {
                    return true;
                }
                visit(entry.handle)
            });
            if !completed {
                return false;
            }
        }
        true
    }

    /// Visit handles by non-decreasing minimum box distance from the
    /// position until `visit` returns false. Handles under several
    /// sub-rects are reported once, at their nearest sub-rect.
    pub fn nearest(&self, lat: f64, lon: f64, visit: &mut dyn FnMut(u64, f64) -> bool) {
        let mut seen: HashSet<u64> = HashSet::new();
        self.tree.nearest(lat, lon, &mut |entry, dist| {
            if self.multi.contains_key(&entry.handle) && !seen.insert(entry.handle) {
                return true;
            }
            visit(entry.handle, dist)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn search_all(ix: &SpatialIndex, b: &BBox) -> Vec<u64> {
        let mut out = Vec::new();
        ix.search(b, &mut |h| {
            out.push(h);
            true
        });
        out.sort_unstable();
        out
    }

    #[test]
    fn antimeridian_object_found_from_both_sides() {
        let mut ix = SpatialIndex::new();
        // Wraps the antimeridian: stored as two sub-rects.
        let wrap = BBox::new(-5.0, 170.0, 5.0, -175.0);
        ix.insert(&wrap, 1);
        assert_eq!(ix.len(), 1);

        assert_eq!(search_all(&ix, &BBox::new(-1.0, 171.0, 1.0, 172.0)), vec![1]);
        assert_eq!(search_all(&ix, &BBox::new(-1.0, -179.0, 1.0, -178.0)), vec![1]);
        // A query covering both halves still reports the handle once.
        assert_eq!(search_all(&ix, &BBox::world()), vec![1]);

        assert!(ix.remove(&wrap, 1));
        assert!(ix.is_empty());
        assert!(search_all(&ix, &BBox::world()).is_empty());
    }

    #[test]
    fn wrapping_query_finds_plain_objects() {
        let mut ix = SpatialIndex::new();
        ix.insert(&BBox::point(0.0, 179.0), 1);
        ix.insert(&BBox::point(0.0, -179.0), 2);
        ix.insert(&BBox::point(0.0, 0.0), 3);
        let q = BBox::new(-1.0, 178.0, 1.0, -178.0);
        assert_eq!(search_all(&ix, &q), vec![1, 2]);
    }

    #[test]
    fn nearest_dedups_multi_rect_handles() {
        let mut ix = SpatialIndex::new();
        ix.insert(&BBox::new(-5.0, 170.0, 5.0, -175.0), 1);
        ix.insert(&BBox::point(0.0, 160.0), 2);
        let mut seen = Vec::new();
        ix.nearest(0.0, 179.0, &mut |h, _| {
            seen.push(h);
            true
        });
        assert_eq!(seen, vec![1, 2]);
    }
}
