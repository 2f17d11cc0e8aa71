//! The per-key object store.
//!
//! Invariants maintained here:
//!
//! - an id exists in `ids` iff its item sits in the arena, and iff the
//!   spatial index holds exactly one (possibly multi-rect) entry for its
//!   handle when the object is geometric
//! - field slot assignment is append-only; a slot index keeps its meaning
//!   for the lifetime of the collection
//! - `points` counts primitive positions, not objects

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;

use meridian_geo::{sphere, BBox, Object};
use meridian_index::SpatialIndex;

use crate::arena::{Arena, Item};

/// Visitor callback: return false to stop the walk.
pub type Visit<'a> = dyn FnMut(&str, &Object, &[f64]) -> bool + 'a;

/// A single field assignment by name.
pub type FieldValue = (String, f64);

#[derive(Debug, Default)]
pub struct Collection {
    ids: BTreeMap<String, u64>,
    arena: Arena,
    spatial: SpatialIndex,
    field_names: HashMap<String, usize>,
    weight: usize,
    points: usize,
}

impl Collection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects.
    pub fn count(&self) -> usize {
        self.ids.len()
    }

    /// Number of primitive positions across all objects.
    pub fn point_count(&self) -> usize {
        self.points
    }

    /// Approximate in-memory cost in bytes.
    pub fn total_weight(&self) -> usize {
        self.weight
    }

    /// Union of the bounding boxes of all geometric objects.
    pub fn bounds(&self) -> Option<BBox> {
        self.spatial.bounds()
    }

    /// Field-name to slot-index table.
    pub fn field_map(&self) -> &HashMap<String, usize> {
        &self.field_names
    }

    /// Field names ordered by slot index.
    pub fn field_arr(&self) -> Vec<String> {
        let mut arr = vec![String::new(); self.field_names.len()];
        for (name, &idx) in &self.field_names {
            arr[idx] = name.clone();
        }
        arr
    }

    /// Insert or replace the object stored under `id`.
    ///
    /// An existing item's field values are adopted by the replacement
    /// before `fields` are applied, so fields not named in the call are
    /// preserved. Returns the previous object and fields (when present)
    /// and the final field vector.
    pub fn upsert(
        &mut self,
        id: &str,
        object: Object,
        fields: &[FieldValue],
    ) -> (Option<Object>, Option<Vec<f64>>, Vec<f64>) {
        let old = self.remove(id);

        let bbox = object.bbox();
        self.weight += object.weight() + id.len();
        self.points += object.position_count();
        let handle = self.arena.insert(Item {
            id: id.to_string(),
            object,
            fields: Vec::new(),
            bbox,
        });
        self.ids.insert(id.to_string(), handle);
        if let Some(b) = &bbox {
            self.spatial.insert(b, handle);
        }

        let (old_obj, old_fields) = match old {
            Some((o, f)) => (Some(o), Some(f)),
            None => (None, None),
        };
        if let Some(adopted) = &old_fields {
            let item = self.arena.get_mut(handle).expect("fresh handle");
            item.fields = adopted.clone();
            self.weight += item.fields.len() * 8;
        }
        for (name, value) in fields {
            let item = self.arena.get_mut(handle).expect("fresh handle");
            assign_field(&mut self.field_names, &mut self.weight, item, name, *value);
        }
        let new_fields = self.arena.get(handle).expect("fresh handle").fields.clone();
        (old_obj, old_fields, new_fields)
    }

    /// Remove and return the object stored under `id`.
    pub fn remove(&mut self, id: &str) -> Option<(Object, Vec<f64>)> {
        let handle = self.ids.remove(id)?;
        let item = self.arena.remove(handle)?;
        if let Some(b) = &item.bbox {
            self.spatial.remove(b, handle);
        }
        self.weight = self
            .weight
            .saturating_sub(item.fields.len() * 8 + item.object.weight() + item.id.len());
        self.points -= item.object.position_count();
        Some((item.object, item.fields))
    }

    /// Look up the object stored under `id`.
    pub fn get(&self, id: &str) -> Option<(&Object, &[f64])> {
        let handle = *self.ids.get(id)?;
        let item = self.arena.get(handle)?;
        Some((&item.object, &item.fields))
    }

    /// Assign one field value. Returns the object, the updated field
    /// vector, and whether the numeric value actually changed.
    pub fn set_field(&mut self, id: &str, name: &str, value: f64) -> Option<(Object, Vec<f64>, bool)> {
        let handle = *self.ids.get(id)?;
        let item = self.arena.get_mut(handle)?;
        let updated = assign_field(&mut self.field_names, &mut self.weight, item, name, value);
        Some((item.object.clone(), item.fields.clone(), updated))
    }

    /// Iterate all items in id order. The cursor counts visited entries;
    /// pass a previous return value to resume after a stopped walk.
    pub fn scan(&self, cursor: u64, desc: bool, visit: &mut Visit) -> u64 {
        let iter: Box<dyn Iterator<Item = (&String, &u64)>> = if desc {
            Box::new(self.ids.iter().rev())
        } else {
            Box::new(self.ids.iter())
        };
        self.walk(cursor, iter, visit)
    }

    /// Iterate items with ids in `[lower, upper)` in id order.
    pub fn scan_range(
        &self,
        cursor: u64,
        lower: &str,
        upper: &str,
        desc: bool,
        visit: &mut Visit,
    ) -> u64 {
        let range = self.ids.range::<str, _>((
            Bound::Included(lower),
            if upper.is_empty() {
                Bound::Unbounded
            } else {
                Bound::Excluded(upper)
            },
        ));
        let iter: Box<dyn Iterator<Item = (&String, &u64)>> = if desc {
            Box::new(range.rev())
        } else {
            Box::new(range)
        };
        self.walk(cursor, iter, visit)
    }

    fn walk<'a>(
        &self,
        cursor: u64,
        iter: impl Iterator<Item = (&'a String, &'a u64)>,
        visit: &mut Visit,
    ) -> u64 {
        let mut idx = 0u64;
        for (_, &handle) in iter {
            let mut active = true;
            if idx >= cursor {
                if let Some(item) = self.arena.get(handle) {
                    active = visit(&item.id, &item.object, &item.fields);
                }
            }
            idx += 1;
            if !active {
                break;
            }
        }
        idx
    }

    /// Items fully contained in the area.
    pub fn within(&self, cursor: u64, sparse: u8, area: &Object, visit: &mut Visit) -> u64 {
        let Some(bbox) = area.bbox() else {
            return 0;
        };
        if sparse > 0 {
            self.search_sparse(&bbox, sparse, &mut |_, o, _| o.within(area), visit);
            return 0;
        }
        self.search(cursor, &bbox, &mut |id, o, f| {
            if o.within(area) {
                visit(id, o, f)
            } else {
                true
            }
        })
    }

    /// Items intersecting the area.
    pub fn intersects(&self, cursor: u64, sparse: u8, area: &Object, visit: &mut Visit) -> u64 {
        let Some(bbox) = area.bbox() else {
            return 0;
        };
        if sparse > 0 {
            self.search_sparse(&bbox, sparse, &mut |_, o, _| o.intersects(area), visit);
            return 0;
        }
        self.search(cursor, &bbox, &mut |id, o, f| {
            if o.intersects(area) {
                visit(id, o, f)
            } else {
                true
            }
        })
    }

    /// Items within `meters` of the center position.
    pub fn nearby(
        &self,
        cursor: u64,
        sparse: u8,
        lat: f64,
        lon: f64,
        meters: f64,
        visit: &mut Visit,
    ) -> u64 {
        let bbox = sphere::bbox_from_center(lat, lon, meters);
        if sparse > 0 {
            self.search_sparse(&bbox, sparse, &mut |_, o, _| o.nearby(lat, lon, meters), visit);
            return 0;
        }
        self.search(cursor, &bbox, &mut |id, o, f| {
            if o.nearby(lat, lon, meters) {
                visit(id, o, f)
            } else {
                true
            }
        })
    }

    /// Raw bbox search with cursor bookkeeping. The cursor counts index
    /// hits, matching or not, so a resumed call skips work already seen.
    fn search(&self, cursor: u64, bbox: &BBox, visit: &mut Visit) -> u64 {
        let mut idx = 0u64;
        self.spatial.search(bbox, &mut |handle| {
            let mut active = true;
            if idx >= cursor {
                if let Some(item) = self.arena.get(handle) {
                    active = visit(&item.id, &item.object, &item.fields);
                }
            }
            idx += 1;
            active
        });
        idx
    }

    /// Sparse search: split the box into a `2^sparse` by `2^sparse` grid
    /// and yield at most one matching item per cell. Not resumable.
    fn search_sparse(
        &self,
        bbox: &BBox,
        sparse: u8,
        matches: &mut dyn FnMut(&str, &Object, &[f64]) -> bool,
        visit: &mut Visit,
    ) {
        let mut seen: HashSet<String> = HashSet::new();
        let mut stopped = false;
        for cell in sparse_cells(bbox, sparse) {
            if stopped {
                break;
            }
            self.spatial.search(&cell, &mut |handle| {
                let Some(item) = self.arena.get(handle) else {
                    return true;
                };
                if seen.contains(&item.id) || !matches(&item.id, &item.object, &item.fields) {
                    return true;
                }
                seen.insert(item.id.clone());
                if !visit(&item.id, &item.object, &item.fields) {
                    stopped = true;
                }
                false // one item per cell
            });
        }
    }
}

/// Split a box into a `2^sparse` x `2^sparse` grid of cells.
fn sparse_cells(bbox: &BBox, sparse: u8) -> Vec<BBox> {
    let split = 1usize << sparse;
    let lat_step = (bbox.max_lat - bbox.min_lat) / split as f64;
    let lon_step = (bbox.max_lon - bbox.min_lon) / split as f64;
    let mut cells = Vec::with_capacity(split * split);
    for yi in 0..split {
        for xi in 0..split {
            let min_lat = bbox.min_lat + lat_step * yi as f64;
            let min_lon = bbox.min_lon + lon_step * xi as f64;
            cells.push(BBox::new(
                min_lat,
                min_lon,
                min_lat + lat_step,
                min_lon + lon_step,
            ));
        }
    }
    cells
}

fn assign_field(
    field_names: &mut HashMap<String, usize>,
    weight: &mut usize,
    item: &mut Item,
    name: &str,
    value: f64,
) -> bool {
    let idx = match field_names.get(name) {
        Some(&i) => i,
        None => {
            let i = field_names.len();
            field_names.insert(name.to_string(), i);
            i
        }
    };
    *weight = weight.saturating_sub(item.fields.len() * 8);
    while item.fields.len() <= idx {
        item.fields.push(f64::NAN);
    }
    *weight += item.fields.len() * 8;
    let old = item.fields[idx];
    let old = if old.is_nan() { 0.0 } else { old };
    item.fields[idx] = value;
    old != value
}
