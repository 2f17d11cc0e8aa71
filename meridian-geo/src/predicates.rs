//! `within` / `intersects` / `nearby` dispatch per object variant.
//!
//! Exact polygon work is delegated to the `geo` crate. Containers without
//! area (points, linestrings) degrade to bounding-box containment, and a
//! point counts as inside a polygon when it touches the boundary.

use geo::{Contains, Intersects};
use geo_types::{Geometry, Point as GtPoint, Polygon};

use crate::bbox::BBox;
use crate::object::{bbox_polygon, coords_of, Object};
use crate::sphere::haversine_distance;

impl Object {
    /// True when this object lies entirely inside `other`.
    pub fn within(&self, other: &Object) -> bool {
        if !self.is_geometry() {
            return false;
        }
        match other {
            Object::String(_) => false,
            Object::Bounds(b) => self.within_bbox(b),
            _ => {
                let (Some(sg), Some(og)) = (self.to_geometry(), other.to_geometry()) else {
                    return false;
                };
                geometry_within(&sg, &og)
            }
        }
    }

    /// True when this object shares any point with `other`.
    pub fn intersects(&self, other: &Object) -> bool {
        if !self.is_geometry() {
            return false;
        }
        match other {
            Object::String(_) => false,
            Object::Bounds(b) => self.intersects_bbox(b),
            _ => {
                let (Some(sg), Some(og)) = (self.to_geometry(), other.to_geometry()) else {
                    return false;
                };
                geometry_intersects(&sg, &og)
            }
        }
    }

    /// True when the object comes within `meters` of the center position.
    ///
    /// Any vertex inside the radius qualifies; an areal object containing
    /// the center also qualifies.
    pub fn nearby(&self, lat: f64, lon: f64, meters: f64) -> bool {
        match self {
            Object::String(_) => false,
            Object::Point(p) => haversine_distance(p.lat, p.lon, lat, lon) <= meters,
            _ => {
                let Some(g) = self.to_geometry() else {
                    return false;
                };
                if coords_of(&g)
                    .iter()
                    .any(|c| haversine_distance(c.y, c.x, lat, lon) <= meters)
                {
                    return true;
                }
                let center = GtPoint::new(lon, lat);
                areal_parts(&g).iter().any(|p| p.intersects(&center))
            }
        }
    }

    /// Bounding-box shortcut for `within`: every position inside the box.
    pub fn within_bbox(&self, b: &BBox) -> bool {
        match self {
            Object::String(_) => false,
            Object::Point(p) => b.contains_point(p.lat, p.lon),
            Object::Bounds(ob) => b.contains_bbox(ob),
            _ => {
                let Some(g) = self.to_geometry() else {
                    return false;
                };
                let coords = coords_of(&g);
                !coords.is_empty() && coords.iter().all(|c| b.contains_point(c.y, c.x))
            }
        }
    }

    /// Bounding-box shortcut for `intersects`.
    pub fn intersects_bbox(&self, b: &BBox) -> bool {
        match self {
            Object::String(_) => false,
            Object::Point(p) => b.contains_point(p.lat, p.lon),
            Object::Bounds(ob) => b.intersects(ob),
            _ => {
                let Some(g) = self.to_geometry() else {
                    return false;
                };
                geometry_intersects(&g, &Geometry::Polygon(bbox_polygon(b)))
            }
        }
    }
}

fn geometry_within(inner: &Geometry<f64>, container: &Geometry<f64>) -> bool {
    let areas = areal_parts(container);
    if areas.is_empty() {
        // Containers without area degrade to bbox containment.
        let Some(cb) = container_bbox(container) else {
            return false;
        };
        let coords = coords_of(inner);
        return !coords.is_empty() && coords.iter().all(|c| cb.contains_point(c.y, c.x));
    }
    // Every part of the inner geometry must sit inside some polygon of the
    // container.
    parts_of(inner)
        .iter()
        .all(|part| areas.iter().any(|poly| polygon_contains(poly, part)))
}

fn geometry_intersects(a: &Geometry<f64>, b: &Geometry<f64>) -> bool {
    match (a, b) {
        (Geometry::GeometryCollection(gc), _) => gc.0.iter().any(|g| geometry_intersects(g, b)),
        (_, Geometry::GeometryCollection(gc)) => gc.0.iter().any(|g| geometry_intersects(a, g)),
        _ => a.intersects(b),
    }
}

fn polygon_contains(poly: &Polygon<f64>, g: &Geometry<f64>) -> bool {
    match g {
        // A point has no extent: touching the boundary counts as inside.
        Geometry::Point(p) => poly.intersects(p),
        Geometry::LineString(ls) => poly.contains(ls),
        Geometry::Polygon(p) => poly.contains(p),
        Geometry::MultiPoint(mp) => mp.0.iter().all(|p| poly.intersects(p)),
        other => {
            let coords = coords_of(other);
            !coords.is_empty() && coords.iter().all(|c| poly.intersects(&GtPoint::new(c.x, c.y)))
        }
    }
}

/// The polygons making up a geometry's area, if any.
fn areal_parts(g: &Geometry<f64>) -> Vec<Polygon<f64>> {
    match g {
        Geometry::Polygon(p) => vec![p.clone()],
        Geometry::MultiPolygon(mp) => mp.0.clone(),
        Geometry::Rect(r) => vec![r.to_polygon()],
        Geometry::Triangle(t) => vec![t.to_polygon()],
        Geometry::GeometryCollection(gc) => gc.0.iter().flat_map(|g| areal_parts(g)).collect(),
        _ => Vec::new(),
    }
}

/// Decompose into indivisible parts for containment checks.
fn parts_of(g: &Geometry<f64>) -> Vec<Geometry<f64>> {
    match g {
        Geometry::MultiPoint(mp) => mp.0.iter().map(|p| Geometry::Point(*p)).collect(),
        Geometry::MultiLineString(mls) => mls
            .0
            .iter()
            .map(|ls| Geometry::LineString(ls.clone()))
            .collect(),
        Geometry::MultiPolygon(mp) => mp
            .0
            .iter()
            .map(|p| Geometry::Polygon(p.clone()))
            .collect(),
        Geometry::GeometryCollection(gc) => gc.0.iter().flat_map(parts_of).collect(),
        other => vec![other.clone()],
    }
}

fn container_bbox(g: &Geometry<f64>) -> Option<BBox> {
    let coords = coords_of(g);
    let mut it = coords.iter();
    let first = it.next()?;
    let mut b = BBox::point(first.y, first.x);
    for c in it {
        b.expand(&BBox::point(c.y, c.x));
    }
    Some(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::GeoPoint;

    fn poly(src: &str) -> Object {
        Object::from_json(src).unwrap()
    }

    fn square() -> Object {
        poly(r#"{"type":"Polygon","coordinates":[[[0,0],[10,0],[10,10],[0,10],[0,0]]]}"#)
    }

    #[test]
    fn point_within_polygon() {
        let p = Object::Point(GeoPoint::new(5.0, 5.0));
        assert!(p.within(&square()));
        let outside = Object::Point(GeoPoint::new(15.0, 5.0));
        assert!(!outside.within(&square()));
    }

    #[test]
    fn point_on_boundary_counts_as_inside() {
        let p = Object::Point(GeoPoint::new(0.0, 5.0));
        assert!(p.within(&square()));
    }

    #[test]
    fn polygon_within_polygon() {
        let inner = poly(r#"{"type":"Polygon","coordinates":[[[2,2],[4,2],[4,4],[2,4],[2,2]]]}"#);
        assert!(inner.within(&square()));
        assert!(!square().within(&inner));
    }

    #[test]
    fn linestring_crossing_intersects_but_not_within() {
        let ls = poly(r#"{"type":"LineString","coordinates":[[-5,5],[5,5]]}"#);
        assert!(ls.intersects(&square()));
        assert!(!ls.within(&square()));
    }

    #[test]
    fn bbox_shortcuts() {
        let b = BBox::new(0.0, 0.0, 10.0, 10.0);
        let p = Object::Point(GeoPoint::new(5.0, 5.0));
        assert!(p.within_bbox(&b));
        assert!(p.intersects_bbox(&b));
        let ls = poly(r#"{"type":"LineString","coordinates":[[-5,5],[5,5]]}"#);
        assert!(!ls.within_bbox(&b));
        assert!(ls.intersects_bbox(&b));
    }

    #[test]
    fn nearby_uses_haversine() {
        let p = Object::Point(GeoPoint::new(33.5, -112.1));
        // ~1.1km north
        assert!(p.nearby(33.51, -112.1, 5000.0));
        assert!(!p.nearby(34.5, -112.1, 5000.0));
    }

    #[test]
    fn nearby_polygon_containing_center() {
        // All vertices are far from the center, but the area covers it.
        let big = poly(r#"{"type":"Polygon","coordinates":[[[-10,-10],[10,-10],[10,10],[-10,10],[-10,-10]]]}"#);
        assert!(big.nearby(0.0, 0.0, 1.0));
    }

    #[test]
    fn strings_never_match() {
        let s = Object::String("x".into());
        assert!(!s.within(&square()));
        assert!(!s.intersects(&square()));
        assert!(!s.nearby(0.0, 0.0, 1e9));
    }

    #[test]
    fn multipolygon_container() {
        let mp = poly(
            r#"{"type":"MultiPolygon","coordinates":[
                [[[0,0],[5,0],[5,5],[0,5],[0,0]]],
                [[[20,20],[25,20],[25,25],[20,25],[20,20]]]]}"#,
        );
        let a = Object::Point(GeoPoint::new(2.0, 2.0));
        let b = Object::Point(GeoPoint::new(22.0, 22.0));
        let c = Object::Point(GeoPoint::new(10.0, 10.0));
        assert!(a.within(&mp));
        assert!(b.within(&mp));
        assert!(!c.within(&mp));
    }
}
