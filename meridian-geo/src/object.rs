//! The tagged geometry value stored per object id.
//!
//! An [`Object`] is what a collection holds for each id: a bare point, a
//! bounding box, a full GeoJSON geometry, a feature wrapper, or an opaque
//! non-geometric string. Canonical JSON bytes are produced here and are
//! the bytes clients see from reads; parsing accepts standard GeoJSON.
//!
//! Coordinate order on the wire is GeoJSON `[lon, lat]`; the `z` ordinate
//! is preserved for bare points only.

use geo_types::{
    Coord, Geometry, GeometryCollection, LineString, MultiLineString, MultiPoint, MultiPolygon,
    Point as GtPoint, Polygon,
};
use serde_json::{json, Map, Value};

use crate::bbox::BBox;
use crate::error::{GeoError, Result};
use crate::geohash;

/// A bare position with an optional z ordinate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
    pub z: Option<f64>,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon, z: None }
    }

    pub fn with_z(lat: f64, lon: f64, z: f64) -> Self {
        Self {
            lat,
            lon,
            z: Some(z),
        }
    }
}

/// A stored geometric (or string) value.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    /// A single position.
    Point(GeoPoint),
    /// A rectangle; set via the BOUNDS argument, serialized as a Polygon.
    Bounds(BBox),
    /// Any GeoJSON geometry (LineString, Polygon, Multi*, GeometryCollection).
    Geometry(Geometry<f64>),
    /// A GeoJSON feature wrapping a geometry, carrying raw properties.
    Feature {
        geometry: Box<Object>,
        properties: Option<Map<String, Value>>,
    },
    /// A non-geometric value. Excluded from the spatial index.
    String(String),
}

impl Object {
    /// Whether the object participates in spatial queries.
    pub fn is_geometry(&self) -> bool {
        !matches!(self, Object::String(_))
    }

    /// Derived bounding box. `None` for non-geometric objects.
    pub fn bbox(&self) -> Option<BBox> {
        match self {
            Object::Point(p) => Some(BBox::point(p.lat, p.lon)),
            Object::Bounds(b) => Some(*b),
            Object::Geometry(g) => geometry_bbox(g),
            Object::Feature { geometry, .. } => geometry.bbox(),
            Object::String(_) => None,
        }
    }

    /// Representative position: the bounding-box center, carrying z when
    /// the object is a bare point.
    pub fn point(&self) -> Option<GeoPoint> {
        match self {
            Object::Point(p) => Some(*p),
            _ => {
                let b = self.bbox()?;
                let (lat, lon) = b.center();
                Some(GeoPoint::new(lat, lon))
            }
        }
    }

    /// Geohash of the representative position.
    pub fn geohash(&self, precision: usize) -> Result<String> {
        let p = self
            .point()
            .ok_or_else(|| GeoError::invalid_json("object has no position"))?;
        geohash::encode(p.lat, p.lon, precision)
    }

    /// Number of primitive positions in the object.
    pub fn position_count(&self) -> usize {
        match self {
            Object::Point(_) => 1,
            Object::Bounds(_) => 2,
            Object::Geometry(g) => geometry_coord_count(g),
            Object::Feature { geometry, .. } => geometry.position_count(),
            Object::String(_) => 0,
        }
    }

    /// Approximate in-memory cost in bytes.
    pub fn weight(&self) -> usize {
        match self {
            Object::String(s) => s.len(),
            Object::Feature {
                geometry,
                properties,
            } => {
                let props = properties
                    .as_ref()
                    .map(|p| Value::Object(p.clone()).to_string().len())
                    .unwrap_or(0);
                geometry.weight() + props
            }
            _ => self.position_count() * 16,
        }
    }

    /// View as a geo-types geometry for exact predicates. `None` for
    /// strings.
    pub fn to_geometry(&self) -> Option<Geometry<f64>> {
        match self {
            Object::Point(p) => Some(Geometry::Point(GtPoint::new(p.lon, p.lat))),
            Object::Bounds(b) => Some(Geometry::Polygon(bbox_polygon(b))),
            Object::Geometry(g) => Some(g.clone()),
            Object::Feature { geometry, .. } => geometry.to_geometry(),
            Object::String(_) => None,
        }
    }

    /// Canonical JSON value.
    pub fn json_value(&self) -> Value {
        match self {
            Object::Point(p) => {
                let coords = match p.z {
                    Some(z) => json!([p.lon, p.lat, z]),
                    None => json!([p.lon, p.lat]),
                };
                json!({"type": "Point", "coordinates": coords})
            }
            Object::Bounds(b) => {
                json!({"type": "Polygon", "coordinates": [[
                    [b.min_lon, b.min_lat],
                    [b.min_lon, b.max_lat],
                    [b.max_lon, b.max_lat],
                    [b.max_lon, b.min_lat],
                    [b.min_lon, b.min_lat],
                ]]})
            }
            Object::Geometry(g) => geometry_json(g),
            Object::Feature {
                geometry,
                properties,
            } => {
                let mut m = Map::new();
                m.insert("type".into(), Value::String("Feature".into()));
                m.insert("geometry".into(), geometry.json_value());
                if let Some(props) = properties {
                    m.insert("properties".into(), Value::Object(props.clone()));
                }
                Value::Object(m)
            }
            Object::String(s) => Value::String(s.clone()),
        }
    }

    /// Canonical JSON bytes.
    pub fn json_bytes(&self) -> String {
        self.json_value().to_string()
    }

    /// Parse a GeoJSON document into an object.
    pub fn from_json(data: &str) -> Result<Object> {
        let value: Value =
            serde_json::from_str(data).map_err(|e| GeoError::invalid_json(e.to_string()))?;
        parse_value(&value)
    }
}

/// Rectangle as a closed counter-clockwise polygon ring.
pub fn bbox_polygon(b: &BBox) -> Polygon<f64> {
    Polygon::new(
        LineString::from(vec![
            (b.min_lon, b.min_lat),
            (b.max_lon, b.min_lat),
            (b.max_lon, b.max_lat),
            (b.min_lon, b.max_lat),
            (b.min_lon, b.min_lat),
        ]),
        vec![],
    )
}

fn parse_value(value: &Value) -> Result<Object> {
    let obj = value
        .as_object()
        .ok_or_else(|| GeoError::invalid_json("expected a json object"))?;
    let typ = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| GeoError::invalid_json("missing 'type' member"))?;

    match typ {
        "Point" => {
            let coords = coords_member(obj)?;
            let (lon, lat, z) = parse_position(coords)?;
            Ok(Object::Point(match z {
                Some(z) => GeoPoint::with_z(lat, lon, z),
                None => GeoPoint::new(lat, lon),
            }))
        }
        "MultiPoint" => {
            let coords = coords_member(obj)?;
            let points = parse_positions(coords)?;
            Ok(Object::Geometry(Geometry::MultiPoint(MultiPoint(
                points.into_iter().map(GtPoint::from).collect(),
            ))))
        }
        "LineString" => {
            let coords = coords_member(obj)?;
            Ok(Object::Geometry(Geometry::LineString(LineString(
                parse_positions(coords)?,
            ))))
        }
        "MultiLineString" => {
            let coords = coords_member(obj)?;
            let lines = as_array(coords)?
                .iter()
                .map(|l| Ok(LineString(parse_positions(l)?)))
                .collect::<Result<Vec<_>>>()?;
            Ok(Object::Geometry(Geometry::MultiLineString(
                MultiLineString(lines),
            )))
        }
        "Polygon" => {
            let coords = coords_member(obj)?;
            Ok(Object::Geometry(Geometry::Polygon(parse_polygon(coords)?)))
        }
        "MultiPolygon" => {
            let coords = coords_member(obj)?;
            let polys = as_array(coords)?
                .iter()
                .map(parse_polygon)
                .collect::<Result<Vec<_>>>()?;
            Ok(Object::Geometry(Geometry::MultiPolygon(MultiPolygon(
                polys,
            ))))
        }
        "GeometryCollection" => {
            let geoms = obj
                .get("geometries")
                .and_then(Value::as_array)
                .ok_or_else(|| GeoError::invalid_json("missing 'geometries' member"))?;
            let mut parts = Vec::with_capacity(geoms.len());
            for g in geoms {
                match parse_value(g)? {
                    Object::Point(p) => parts.push(Geometry::Point(GtPoint::new(p.lon, p.lat))),
                    Object::Geometry(g) => parts.push(g),
                    _ => return Err(GeoError::invalid_json("invalid geometry in collection")),
                }
            }
            Ok(Object::Geometry(Geometry::GeometryCollection(
                GeometryCollection(parts),
            )))
        }
        "Feature" => {
            let geometry = obj
                .get("geometry")
                .ok_or_else(|| GeoError::invalid_json("missing 'geometry' member"))?;
            let geometry = Box::new(parse_value(geometry)?);
            if matches!(*geometry, Object::Feature { .. }) {
                return Err(GeoError::invalid_json("nested features are not supported"));
            }
            let properties = obj
                .get("properties")
                .and_then(Value::as_object)
                .cloned();
            Ok(Object::Feature {
                geometry,
                properties,
            })
        }
        other => Err(GeoError::invalid_json(format!(
            "unknown geojson type '{other}'"
        ))),
    }
}

fn coords_member(obj: &Map<String, Value>) -> Result<&Value> {
    obj.get("coordinates")
        .ok_or_else(|| GeoError::invalid_json("missing 'coordinates' member"))
}

fn as_array(v: &Value) -> Result<&Vec<Value>> {
    v.as_array()
        .ok_or_else(|| GeoError::invalid_json("expected an array"))
}

fn parse_position(v: &Value) -> Result<(f64, f64, Option<f64>)> {
    let arr = as_array(v)?;
    if arr.len() < 2 {
        return Err(GeoError::invalid_json("position needs at least 2 ordinates"));
    }
    let lon = arr[0]
        .as_f64()
        .ok_or_else(|| GeoError::invalid_json("non-numeric ordinate"))?;
    let lat = arr[1]
        .as_f64()
        .ok_or_else(|| GeoError::invalid_json("non-numeric ordinate"))?;
    let z = arr.get(2).and_then(Value::as_f64);
    Ok((lon, lat, z))
}

fn parse_positions(v: &Value) -> Result<Vec<Coord<f64>>> {
    as_array(v)?
        .iter()
        .map(|p| {
            let (lon, lat, _) = parse_position(p)?;
            Ok(Coord { x: lon, y: lat })
        })
        .collect()
}

fn parse_polygon(v: &Value) -> Result<Polygon<f64>> {
    let rings = as_array(v)?;
    if rings.is_empty() {
        return Err(GeoError::invalid_json("polygon needs at least one ring"));
    }
    let exterior = LineString(parse_positions(&rings[0])?);
    let interiors = rings[1..]
        .iter()
        .map(|r| Ok(LineString(parse_positions(r)?)))
        .collect::<Result<Vec<_>>>()?;
    Ok(Polygon::new(exterior, interiors))
}

fn geometry_bbox(g: &Geometry<f64>) -> Option<BBox> {
    let mut bbox: Option<BBox> = None;
    for c in coords_of(g) {
        let pt = BBox::point(c.y, c.x);
        match bbox.as_mut() {
            Some(b) => b.expand(&pt),
            None => bbox = Some(pt),
        }
    }
    bbox
}

fn geometry_coord_count(g: &Geometry<f64>) -> usize {
    coords_of(g).len()
}

/// Flatten every coordinate position of a geometry.
pub(crate) fn coords_of(g: &Geometry<f64>) -> Vec<Coord<f64>> {
    let mut out = Vec::new();
    collect_coords(g, &mut out);
    out
}

fn collect_coords(g: &Geometry<f64>, out: &mut Vec<Coord<f64>>) {
    match g {
        Geometry::Point(p) => out.push(p.0),
        Geometry::Line(l) => {
            out.push(l.start);
            out.push(l.end);
        }
        Geometry::LineString(ls) => out.extend(ls.0.iter().copied()),
        Geometry::Polygon(p) => {
            out.extend(p.exterior().0.iter().copied());
            for ring in p.interiors() {
                out.extend(ring.0.iter().copied());
            }
        }
        Geometry::MultiPoint(mp) => out.extend(mp.0.iter().map(|p| p.0)),
        Geometry::MultiLineString(mls) => {
            for ls in &mls.0 {
                out.extend(ls.0.iter().copied());
            }
        }
        Geometry::MultiPolygon(mp) => {
            for p in &mp.0 {
                collect_coords(&Geometry::Polygon(p.clone()), out);
            }
        }
        Geometry::GeometryCollection(gc) => {
            for g in &gc.0 {
                collect_coords(g, out);
            }
        }
        Geometry::Rect(r) => {
            out.push(r.min());
            out.push(r.max());
        }
        Geometry::Triangle(t) => out.extend([t.0, t.1, t.2]),
    }
}

fn geometry_json(g: &Geometry<f64>) -> Value {
    match g {
        Geometry::Point(p) => json!({"type": "Point", "coordinates": [p.x(), p.y()]}),
        Geometry::MultiPoint(mp) => json!({
            "type": "MultiPoint",
            "coordinates": mp.0.iter().map(|p| json!([p.x(), p.y()])).collect::<Vec<_>>(),
        }),
        Geometry::LineString(ls) => json!({
            "type": "LineString",
            "coordinates": ring_json(ls),
        }),
        Geometry::MultiLineString(mls) => json!({
            "type": "MultiLineString",
            "coordinates": mls.0.iter().map(ring_json).collect::<Vec<_>>(),
        }),
        Geometry::Polygon(p) => json!({
            "type": "Polygon",
            "coordinates": polygon_json(p),
        }),
        Geometry::MultiPolygon(mp) => json!({
            "type": "MultiPolygon",
            "coordinates": mp.0.iter().map(polygon_json).collect::<Vec<_>>(),
        }),
        Geometry::GeometryCollection(gc) => json!({
            "type": "GeometryCollection",
            "geometries": gc.0.iter().map(geometry_json).collect::<Vec<_>>(),
        }),
        // Remaining geo-types variants never come from GeoJSON parsing.
        other => {
            let mut out = Vec::new();
            collect_coords(other, &mut out);
            json!({
                "type": "MultiPoint",
                "coordinates": out.iter().map(|c| json!([c.x, c.y])).collect::<Vec<_>>(),
            })
        }
    }
}

fn ring_json(ls: &LineString<f64>) -> Value {
    Value::Array(ls.0.iter().map(|c| json!([c.x, c.y])).collect())
}

fn polygon_json(p: &Polygon<f64>) -> Value {
    let mut rings = vec![ring_json(p.exterior())];
    rings.extend(p.interiors().iter().map(ring_json));
    Value::Array(rings)
}
