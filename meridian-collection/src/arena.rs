//! Item arena: slot storage with a free list.
//!
//! The collection owns its items here; the ordered id map and the spatial
//! index both refer to items by slot handle, which keeps the index free of
//! owning references.

use meridian_geo::{BBox, Object};

#[derive(Debug)]
pub struct Item {
    pub id: String,
    pub object: Object,
    pub fields: Vec<f64>,
    /// Cached derived box; `None` for non-geometric objects.
    pub bbox: Option<BBox>,
}

#[derive(Debug, Default)]
pub struct Arena {
    slots: Vec<Option<Item>>,
    free: Vec<u64>,
}

impl Arena {
    pub fn insert(&mut self, item: Item) -> u64 {
        match self.free.pop() {
            Some(h) => {
                self.slots[h as usize] = Some(item);
                h
            }
            None => {
                self.slots.push(Some(item));
                (self.slots.len() - 1) as u64
            }
        }
    }

    pub fn remove(&mut self, handle: u64) -> Option<Item> {
        let slot = self.slots.get_mut(handle as usize)?;
        let item = slot.take();
        if item.is_some() {
            self.free.push(handle);
        }
        item
    }

    pub fn get(&self, handle: u64) -> Option<&Item> {
        self.slots.get(handle as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, handle: u64) -> Option<&mut Item> {
        self.slots.get_mut(handle as usize)?.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_geo::GeoPoint;

    fn item(id: &str) -> Item {
        Item {
            id: id.to_string(),
            object: Object::Point(GeoPoint::new(0.0, 0.0)),
            fields: Vec::new(),
            bbox: None,
        }
    }

    #[test]
    fn slots_are_reused() {
        let mut a = Arena::default();
        let h1 = a.insert(item("a"));
        let h2 = a.insert(item("b"));
        assert_ne!(h1, h2);
        assert!(a.remove(h1).is_some());
        assert!(a.get(h1).is_none());
        let h3 = a.insert(item("c"));
        assert_eq!(h3, h1);
        assert_eq!(a.get(h2).unwrap().id, "b");
        assert_eq!(a.get(h3).unwrap().id, "c");
    }

    #[test]
    fn double_remove_is_none() {
        let mut a = Arena::default();
        let h = a.insert(item("a"));
        assert!(a.remove(h).is_some());
        assert!(a.remove(h).is_none());
    }
}
