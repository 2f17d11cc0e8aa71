//! Per-item JSON rendering shared by the search commands and the fence
//! evaluator.
//!
//! A `ScanWriter` accumulates the body of a search reply: the optional
//! field-name header, one rendered entry per accepted item, and the
//! `count`/`cursor` footer. The fence evaluator reuses the same rendering
//! with `full_fields` set, then takes the bare item fragment for embedding
//! in event messages.

use std::collections::HashMap;

use meridian_geo::{BBox, GeoPoint, Object};

use crate::args::{SearchOptions, SearchOutput, Where};
use crate::glob::{glob_match, is_glob};
use crate::protocol::json_string;

pub struct ScanWriter {
    buf: String,
    fmap: HashMap<String, usize>,
    farr: Vec<String>,
    output: SearchOutput,
    wheres: Vec<Where>,
    nofields: bool,
    glob: String,
    glob_everything: bool,
    glob_single: bool,
    limit: u64,
    items: u64,
    hit_limit: bool,
    once: bool,
    count: u64,
    /// Render fields as a name/value object (fence messages) instead of
    /// the positional array used by search replies.
    full_fields: bool,
}

impl ScanWriter {
    pub fn new(
        fmap: HashMap<String, usize>,
        farr: Vec<String>,
        opts: &SearchOptions,
    ) -> ScanWriter {
        let glob = opts.glob.clone();
        let glob_everything = glob.is_empty() || glob == "*";
        let glob_single = !glob_everything && !is_glob(&glob);
        ScanWriter {
            buf: String::new(),
            fmap,
            farr,
            output: opts.output,
            wheres: opts.wheres.clone(),
            nofields: opts.nofields,
            glob,
            glob_everything,
            glob_single,
            limit: opts.limit,
            items: 0,
            hit_limit: false,
            once: false,
            count: 0,
            full_fields: false,
        }
    }

    /// Writer for fence messages: name/value fields, no limit.
    pub fn for_fence(fmap: HashMap<String, usize>, opts: &SearchOptions) -> ScanWriter {
        let mut sw = ScanWriter::new(fmap, Vec::new(), opts);
        sw.full_fields = true;
        sw.limit = u64::MAX;
        sw
    }

    fn has_fields_output(&self) -> bool {
        !self.nofields
            && matches!(
                self.output,
                SearchOutput::Objects
                    | SearchOutput::Points
                    | SearchOutput::Hashes(_)
                    | SearchOutput::Bounds
            )
    }

    /// The `"fields"` name header plus the opening of the entry array.
    pub fn write_head(&mut self) {
        if !self.farr.is_empty() && self.has_fields_output() {
            self.buf.push_str(",\"fields\":[");
            for (i, f) in self.farr.iter().enumerate() {
                if i > 0 {
                    self.buf.push(',');
                }
                self.buf.push_str(&json_string(f));
            }
            self.buf.push(']');
        }
        match self.output {
            SearchOutput::Ids => self.buf.push_str(",\"ids\":["),
            SearchOutput::Objects => self.buf.push_str(",\"objects\":["),
            SearchOutput::Points => self.buf.push_str(",\"points\":["),
            SearchOutput::Bounds => self.buf.push_str(",\"bounds\":["),
            SearchOutput::Hashes(_) => self.buf.push_str(",\"hashes\":["),
            SearchOutput::Count => {}
        }
    }

    /// Close the entry array and append count/cursor.
    pub fn write_foot(&mut self, cursor: u64) {
        let cursor = if self.hit_limit { cursor } else { 0 };
        if self.output != SearchOutput::Count {
            self.buf.push(']');
        }
        self.buf.push_str(&format!(",\"count\":{}", self.count));
        self.buf.push_str(&format!(",\"cursor\":{cursor}"));
    }

    /// Whether the WHERE clauses accept this item's fields.
    fn field_match(&self, fields: &[f64], obj: &Object) -> bool {
        for w in &self.wheres {
            if w.field == "z" {
                let z = obj.point().and_then(|p| p.z).unwrap_or(0.0);
                if !w.matches(z) {
                    return false;
                }
                continue;
            }
            // A field never assigned for this item fails the clause.
            let value = self
                .fmap
                .get(&w.field)
                .and_then(|&idx| fields.get(idx))
                .copied();
            match value {
                Some(v) if !v.is_nan() => {
                    if !w.matches(v) {
                        return false;
                    }
                }
                _ => return false,
            }
        }
        true
    }

    /// Render one item. Returns false when the walk should stop (limit
    /// reached, or a single-id glob was satisfied).
    pub fn write_object(&mut self, id: &str, obj: &Object, fields: &[f64]) -> bool {
        let mut keep_going = true;
        if !self.glob_everything {
            if self.glob_single {
                if self.glob != id {
                    return true;
                }
                keep_going = false;
            } else if !glob_match(&self.glob, id) {
                return true;
            }
        }
        if !self.field_match(fields, obj) {
            return true;
        }
        self.count += 1;
        if self.output == SearchOutput::Count {
            return keep_going;
        }

        if self.once {
            self.buf.push(',');
        } else {
            self.once = true;
        }

        if self.output == SearchOutput::Ids {
            self.buf.push_str(&json_string(id));
        } else {
            self.buf.push_str("{\"id\":");
            self.buf.push_str(&json_string(id));
            match self.output {
                SearchOutput::Objects => {
                    self.buf.push_str(",\"object\":");
                    self.buf.push_str(&obj.json_bytes());
                }
                SearchOutput::Points => {
                    self.buf.push_str(",\"point\":");
                    self.buf.push_str(&point_json(obj.point()));
                }
                SearchOutput::Hashes(precision) => {
                    let hash = obj.geohash(precision).unwrap_or_default();
                    self.buf.push_str(",\"hash\":");
                    self.buf.push_str(&json_string(&hash));
                }
                SearchOutput::Bounds => {
                    self.buf.push_str(",\"bounds\":");
                    self.buf.push_str(&bounds_json(obj.bbox()));
                }
                _ => {}
            }
            let fragment = self.fields_fragment(fields);
            self.buf.push_str(&fragment);
            self.buf.push('}');
        }

        self.items += 1;
        if self.items == self.limit {
            self.hit_limit = true;
            return false;
        }
        keep_going
    }

    fn fields_fragment(&self, fields: &[f64]) -> String {
        if !self.has_fields_output() && !self.full_fields {
            return String::new();
        }
        if self.full_fields {
            if self.fmap.is_empty() {
                return String::new();
            }
            let mut named: Vec<(&str, f64)> = Vec::new();
            for (name, &idx) in &self.fmap {
                if let Some(&v) = fields.get(idx) {
                    if !v.is_nan() {
                        named.push((name, v));
                    }
                }
            }
            if named.is_empty() {
                return String::new();
            }
            named.sort_by(|a, b| a.0.cmp(b.0));
            let body: Vec<String> = named
                .iter()
                .map(|(n, v)| format!("{}:{}", json_string(n), v))
                .collect();
            format!(",\"fields\":{{{}}}", body.join(","))
        } else if !self.farr.is_empty() {
            let vals: Vec<String> = (0..self.farr.len())
                .map(|idx| {
                    let v = fields.get(idx).copied().unwrap_or(f64::NAN);
                    let v = if v.is_nan() { 0.0 } else { v };
                    format!("{v}")
                })
                .collect();
            format!(",\"fields\":[{}]", vals.join(","))
        } else {
            String::new()
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// The accumulated body.
    pub fn body(&self) -> &str {
        &self.buf
    }

    /// Take the bare item fragment written so far (no leading comma);
    /// used by the fence evaluator. Resets the buffer.
    pub fn take_fragment(&mut self) -> String {
        let mut s = std::mem::take(&mut self.buf);
        self.once = false;
        if let Some(stripped) = s.strip_prefix(',') {
            s = stripped.to_string();
        }
        if self.output == SearchOutput::Ids && !s.is_empty() {
            s = format!("{{\"id\":{s}}}");
        }
        s
    }
}

/// External point rendering: `{"lat":...,"lon":...}` plus optional z.
pub fn point_json(p: Option<GeoPoint>) -> String {
    match p {
        Some(p) => match p.z {
            Some(z) => format!("{{\"lat\":{},\"lon\":{},\"z\":{}}}", p.lat, p.lon, z),
            None => format!("{{\"lat\":{},\"lon\":{}}}", p.lat, p.lon),
        },
        None => "null".to_string(),
    }
}

/// External bounds rendering: south-west and north-east corners.
pub fn bounds_json(b: Option<BBox>) -> String {
    match b {
        Some(b) => format!(
            "{{\"sw\":{{\"lat\":{},\"lon\":{}}},\"ne\":{{\"lat\":{},\"lon\":{}}}}}",
            b.min_lat, b.min_lon, b.max_lat, b.max_lon
        ),
        None => "null".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_geo::GeoPoint;

    fn opts(output: SearchOutput) -> SearchOptions {
        SearchOptions {
            key: "k".into(),
            cursor: 0,
            limit: 100,
            sparse: 0,
            glob: String::new(),
            wheres: Vec::new(),
            nofields: false,
            fence: false,
            desc: false,
            detect: None,
            commands: None,
            output,
        }
    }

    #[test]
    fn objects_body_shape() {
        let mut sw = ScanWriter::new(HashMap::new(), Vec::new(), &opts(SearchOutput::Objects));
        sw.write_head();
        sw.write_object("a", &Object::Point(GeoPoint::new(1.0, 2.0)), &[]);
        sw.write_object("b", &Object::Point(GeoPoint::new(3.0, 4.0)), &[]);
        sw.write_foot(0);
        let body = sw.body();
        assert!(body.starts_with(",\"objects\":["));
        assert!(body.contains("\"id\":\"a\""));
        assert!(body.contains("\"count\":2"));
        assert!(body.ends_with(",\"cursor\":0"));
    }

    #[test]
    fn count_output_counts_only() {
        let mut sw = ScanWriter::new(HashMap::new(), Vec::new(), &opts(SearchOutput::Count));
        sw.write_head();
        for i in 0..5 {
            sw.write_object(&i.to_string(), &Object::Point(GeoPoint::new(0.0, 0.0)), &[]);
        }
        sw.write_foot(0);
        assert_eq!(sw.count(), 5);
        assert!(!sw.body().contains('['));
    }

    #[test]
    fn limit_stops_walk_and_reports_cursor() {
        let mut o = opts(SearchOutput::Ids);
        o.limit = 2;
        let mut sw = ScanWriter::new(HashMap::new(), Vec::new(), &o);
        sw.write_head();
        assert!(sw.write_object("a", &Object::Point(GeoPoint::new(0.0, 0.0)), &[]));
        assert!(!sw.write_object("b", &Object::Point(GeoPoint::new(0.0, 0.0)), &[]));
        sw.write_foot(7);
        assert!(sw.body().ends_with(",\"cursor\":7"));
    }

    #[test]
    fn where_rejects_undefined_fields() {
        let mut fmap = HashMap::new();
        fmap.insert("speed".to_string(), 0);
        let mut o = opts(SearchOutput::Count);
        o.wheres.push(Where {
            field: "speed".into(),
            min: 50.0,
            min_exclusive: false,
            max: f64::INFINITY,
            max_exclusive: false,
        });
        let mut sw = ScanWriter::new(fmap, vec!["speed".into()], &o);
        let obj = Object::Point(GeoPoint::new(0.0, 0.0));
        sw.write_object("fast", &obj, &[70.0]);
        sw.write_object("slow", &obj, &[35.0]);
        sw.write_object("unset", &obj, &[f64::NAN]);
        sw.write_object("novec", &obj, &[]);
        assert_eq!(sw.count(), 1);
    }

    #[test]
    fn single_id_glob_short_circuits() {
        let mut o = opts(SearchOutput::Ids);
        o.glob = "truck7".into();
        let mut sw = ScanWriter::new(HashMap::new(), Vec::new(), &o);
        let obj = Object::Point(GeoPoint::new(0.0, 0.0));
        assert!(sw.write_object("truck1", &obj, &[]));
        assert!(!sw.write_object("truck7", &obj, &[]));
        assert_eq!(sw.count(), 1);
    }

    #[test]
    fn fence_fragment_uses_named_fields() {
        let mut fmap = HashMap::new();
        fmap.insert("speed".to_string(), 0);
        let mut sw = ScanWriter::for_fence(fmap, &opts(SearchOutput::Objects));
        sw.write_object("t1", &Object::Point(GeoPoint::new(1.0, 2.0)), &[35.0]);
        let frag = sw.take_fragment();
        assert!(frag.starts_with("{\"id\":\"t1\""));
        assert!(frag.contains("\"fields\":{\"speed\":35}"));
    }
}
