//! The R-tree proper.
//!
//! Nodes hold between 2 and [`MAX_ENTRIES`] children; a split produces two
//! groups of at least [`MIN_ENTRIES`]. The split heuristic seeds the two
//! groups with the pair wasting the most combined volume, then assigns the
//! rest by least enlargement. Volume is the spherical surface area
//! surrogate `(sin(max_lat) - sin(min_lat)) * (max_lon - min_lon)`, which
//! keeps high-latitude rects from dominating splits the way flat degree
//! area would.
//!
//! Rectangles must already be normalized to `[-180,180] x [-90,90]`; the
//! wrapping [`crate::SpatialIndex`] guarantees that.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use meridian_geo::BBox;

/// Maximum number of entries or children per node.
pub const MAX_ENTRIES: usize = 16;

/// Minimum fill after a split; nodes falling below this on removal are
/// dissolved and their entries reinserted.
pub const MIN_ENTRIES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Entry {
    pub rect: BBox,
    pub handle: u64,
}

#[derive(Debug)]
struct Node {
    rect: BBox,
    leaf: bool,
    entries: Vec<Entry>,
    children: Vec<Node>,
}

impl Node {
    fn new_leaf() -> Self {
        Node {
            rect: BBox::point(0.0, 0.0),
            leaf: true,
            entries: Vec::new(),
            children: Vec::new(),
        }
    }

    fn fanout(&self) -> usize {
        if self.leaf {
            self.entries.len()
        } else {
            self.children.len()
        }
    }

    fn recalc_rect(&mut self) {
        let mut rect: Option<BBox> = None;
        let mut add = |r: &BBox| match rect.as_mut() {
            Some(b) => b.expand(r),
            None => rect = Some(*r),
        };
        if self.leaf {
            for e in &self.entries {
                add(&e.rect);
            }
        } else {
            for c in &self.children {
                add(&c.rect);
            }
        }
        if let Some(r) = rect {
            self.rect = r;
        }
    }
}

/// Spherical surface-area surrogate of a rect.
fn volume(r: &BBox) -> f64 {
    let lat_span = r.max_lat.to_radians().sin() - r.min_lat.to_radians().sin();
    let lon_span = r.max_lon - r.min_lon;
    lat_span.max(0.0) * lon_span.max(0.0)
}

fn union(a: &BBox, b: &BBox) -> BBox {
    let mut r = *a;
    r.expand(b);
    r
}

fn enlargement(r: &BBox, add: &BBox) -> f64 {
    volume(&union(r, add)) - volume(r)
}

/// An R-tree of bounding-box keyed `u64` handles.
#[derive(Debug, Default)]
pub struct RTree {
    root: Option<Node>,
    len: usize,
}

impl RTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries (counting duplicates separately).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Union of all stored rects; `None` when empty.
    pub fn bounds(&self) -> Option<BBox> {
        self.root.as_ref().map(|n| n.rect)
    }

    pub fn insert(&mut self, rect: BBox, handle: u64) {
        let entry = Entry { rect, handle };
        self.len += 1;
        if self.root.is_none() {
            let mut n = Node::new_leaf();
            n.rect = rect;
            n.entries.push(entry);
            self.root = Some(n);
            return;
        }
        let sibling = insert_rec(self.root.as_mut().expect("root present"), entry);
        if let Some(sibling) = sibling {
            let old = self.root.take().expect("root present");
            let mut new_root = Node {
                rect: union(&old.rect, &sibling.rect),
                leaf: false,
                entries: Vec::new(),
                children: vec![old, sibling],
            };
            new_root.recalc_rect();
            self.root = Some(new_root);
        }
    }

    /// Remove one `(rect, handle)` entry. Returns false when absent.
    pub fn remove(&mut self, rect: BBox, handle: u64) -> bool {
        let Some(root) = self.root.as_mut() else {
            return false;
        };
        let mut orphans: Vec<Entry> = Vec::new();
        if !remove_rec(root, &rect, handle, &mut orphans) {
            return false;
        }
        self.len -= 1;
        // Shrink or drop the root.
        loop {
            let replace = {
                let Some(r) = self.root.as_mut() else { break };
                if !r.leaf && r.children.len() == 1 {
                    Some(r.children.pop().expect("one child"))
                } else if r.leaf && r.entries.is_empty() {
                    None
                } else {
                    break;
                }
            };
            match replace {
                Some(child) => self.root = Some(child),
                None => {
                    self.root = None;
                    break;
                }
            }
        }
        for e in orphans {
            self.len -= 1; // insert() re-increments
            self.insert(e.rect, e.handle);
        }
        true
    }

    /// Visit every entry whose rect intersects `rect`. `visit` returning
    /// false stops the traversal; the return value reports whether the
    /// walk ran to completion.
    pub fn search(&self, rect: &BBox, visit: &mut dyn FnMut(&Entry) -> bool) -> bool {
        match &self.root {
            None => true,
            Some(root) => search_rec(root, rect, visit),
        }
    }

    /// Visit entries ordered by minimum rect distance (in degree space) to
    /// the position, nearest first, until `visit` returns false.
    pub fn nearest(&self, lat: f64, lon: f64, visit: &mut dyn FnMut(&Entry, f64) -> bool) {
        let Some(root) = &self.root else {
            return;
        };
        let mut heap: BinaryHeap<QueueItem> = BinaryHeap::new();
        heap.push(QueueItem {
            dist: rect_dist(&root.rect, lat, lon),
            kind: QueueKind::Node(root),
        });
        while let Some(item) = heap.pop() {
            match item.kind {
                QueueKind::Entry(e) => {
                    if !visit(e, item.dist) {
                        return;
                    }
                }
                QueueKind::Node(n) => {
                    if n.leaf {
                        for e in &n.entries {
                            heap.push(QueueItem {
                                dist: rect_dist(&e.rect, lat, lon),
                                kind: QueueKind::Entry(e),
                            });
                        }
                    } else {
                        for c in &n.children {
                            heap.push(QueueItem {
                                dist: rect_dist(&c.rect, lat, lon),
                                kind: QueueKind::Node(c),
                            });
                        }
                    }
                }
            }
        }
    }
}

fn insert_rec(node: &mut Node, entry: Entry) -> Option<Node> {
    node.rect = union(&node.rect, &entry.rect);
    if node.leaf {
        node.entries.push(entry);
        if node.entries.len() > MAX_ENTRIES {
            return Some(split_leaf(node));
        }
        return None;
    }
    let idx = choose_child(node, &entry.rect);
    if let Some(sibling) = insert_rec(&mut node.children[idx], entry) {
        node.children.push(sibling);
        if node.children.len() > MAX_ENTRIES {
            return Some(split_branch(node));
        }
    }
    None
}

fn choose_child(node: &Node, rect: &BBox) -> usize {
    let mut best = 0usize;
    let mut best_enl = f64::INFINITY;
    let mut best_vol = f64::INFINITY;
    for (i, c) in node.children.iter().enumerate() {
        let enl = enlargement(&c.rect, rect);
        let vol = volume(&c.rect);
        if enl < best_enl || (enl == best_enl && vol < best_vol) {
            best = i;
            best_enl = enl;
            best_vol = vol;
        }
    }
    best
}

fn split_leaf(node: &mut Node) -> Node {
    let items = std::mem::take(&mut node.entries);
    let (a, b) = split_items(items, |e| e.rect);
    node.entries = a;
    node.recalc_rect();
    let mut sibling = Node::new_leaf();
    sibling.entries = b;
    sibling.recalc_rect();
    sibling
}

fn split_branch(node: &mut Node) -> Node {
    let items = std::mem::take(&mut node.children);
    let (a, b) = split_items(items, |c| c.rect);
    node.children = a;
    node.recalc_rect();
    let mut sibling = Node {
        rect: BBox::point(0.0, 0.0),
        leaf: false,
        entries: Vec::new(),
        children: b,
    };
    sibling.recalc_rect();
    sibling
}

/// Quadratic-style split: seed with the pair wasting the most volume, then
/// assign by least enlargement while honoring the minimum fill.
fn split_items<T>(mut items: Vec<T>, rect_of: impl Fn(&T) -> BBox) -> (Vec<T>, Vec<T>) {
    debug_assert!(items.len() > MAX_ENTRIES);

    // Pick seeds.
    let (mut s1, mut s2) = (0usize, 1usize);
    let mut worst = f64::NEG_INFINITY;
    for i in 0..items.len() {
        for j in (i + 1)..items.len() {
            let (ri, rj) = (rect_of(&items[i]), rect_of(&items[j]));
            let waste = volume(&union(&ri, &rj)) - volume(&ri) - volume(&rj);
            if waste > worst {
                worst = waste;
                s1 = i;
                s2 = j;
            }
        }
    }
    // Remove the higher index first so the lower stays valid.
    let second = items.remove(s2.max(s1));
    let first = items.remove(s1.min(s2));

    let mut rect_a = rect_of(&first);
    let mut rect_b = rect_of(&second);
    let mut group_a = vec![first];
    let mut group_b = vec![second];

    while let Some(item) = items.pop() {
        let remaining = items.len();
        // Force-assign once a group must take everything left to reach
        // the minimum fill.
        if group_a.len() + remaining + 1 <= MIN_ENTRIES {
            rect_a = union(&rect_a, &rect_of(&item));
            group_a.push(item);
            continue;
        }
        if group_b.len() + remaining + 1 <= MIN_ENTRIES {
            rect_b = union(&rect_b, &rect_of(&item));
            group_b.push(item);
            continue;
        }
        let r = rect_of(&item);
        let enl_a = enlargement(&rect_a, &r);
        let enl_b = enlargement(&rect_b, &r);
        let to_a = match enl_a.partial_cmp(&enl_b) {
            Some(Ordering::Less) => true,
            Some(Ordering::Greater) => false,
            _ => group_a.len() <= group_b.len(),
        };
        if to_a {
            rect_a = union(&rect_a, &r);
            group_a.push(item);
        } else {
            rect_b = union(&rect_b, &r);
            group_b.push(item);
        }
    }
    (group_a, group_b)
}

fn remove_rec(node: &mut Node, rect: &BBox, handle: u64, orphans: &mut Vec<Entry>) -> bool {
    if node.leaf {
        if let Some(pos) = node
            .entries
            .iter()
            .position(|e| e.handle == handle && e.rect == *rect)
        {
            node.entries.remove(pos);
            node.recalc_rect();
            return true;
        }
        return false;
    }
    for i in 0..node.children.len() {
        if !node.children[i].rect.intersects(rect) {
            continue;
        }
        if remove_rec(&mut node.children[i], rect, handle, orphans) {
            if node.children[i].fanout() < MIN_ENTRIES {
                let dead = node.children.remove(i);
                collect_entries(dead, orphans);
            }
            node.recalc_rect();
            return true;
        }
    }
    false
}

fn collect_entries(node: Node, out: &mut Vec<Entry>) {
    if node.leaf {
        out.extend(node.entries);
    } else {
        for c in node.children {
            collect_entries(c, out);
        }
    }
}

fn search_rec(node: &Node, rect: &BBox, visit: &mut dyn FnMut(&Entry) -> bool) -> bool {
    if !node.rect.intersects(rect) {
        return true;
    }
    if node.leaf {
        for e in &node.entries {
            if e.rect.intersects(rect) && !visit(e) {
                return false;
            }
        }
        return true;
    }
    for c in &node.children {
        if !search_rec(c, rect, visit) {
            return false;
        }
    }
    true
}

/// Minimum distance from a rect to a position, in degree space.
fn rect_dist(r: &BBox, lat: f64, lon: f64) -> f64 {
    let dlat = (r.min_lat - lat).max(0.0).max(lat - r.max_lat);
    let dlon = (r.min_lon - lon).max(0.0).max(lon - r.max_lon);
    (dlat * dlat + dlon * dlon).sqrt()
}

enum QueueKind<'a> {
    Node(&'a Node),
    Entry(&'a Entry),
}

struct QueueItem<'a> {
    dist: f64,
    kind: QueueKind<'a>,
}

impl PartialEq for QueueItem<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.dist == other.dist
    }
}

impl Eq for QueueItem<'_> {}

impl PartialOrd for QueueItem<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert for nearest-first.
        other
            .dist
            .partial_cmp(&self.dist)
            .unwrap_or(Ordering::Equal)
    }
}
