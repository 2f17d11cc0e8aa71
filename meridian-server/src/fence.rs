//! Fence evaluation: given a mutation, decide which events a subscriber
//! receives.
//!
//! Containment fences compare the predicate on the old and new object:
//!
//! - both in  -> `inside`
//! - in, out  -> `exit` plus `outside`
//! - out, in  -> `enter` plus `inside` (an FSET on an object already
//!   inside reports `inside`, never `enter`)
//! - out, out -> `cross` plus `outside` when the straight segment between
//!   the two positions cuts the area
//!
//! Roam fences search the roam target collection around the moved object.
//! Every message carries a group id: fresh on `enter`/`cross`, otherwise
//! the persistent id for `(key, id)`.

use std::collections::HashMap;

use chrono::SecondsFormat;
use geo_types::{Coord, Geometry, LineString};
use meridian_geo::{sphere, Object};

use crate::args::{SearchOptions, SearchOutput, Where};
use crate::db::{CommandDetails, Db};
use crate::glob::{glob_match, is_glob};
use crate::protocol::json_string;
use crate::scan_writer::ScanWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceCmd {
    Nearby,
    Within,
    Intersects,
}

impl FenceCmd {
    pub fn name(&self) -> &'static str {
        match self {
            FenceCmd::Nearby => "nearby",
            FenceCmd::Within => "within",
            FenceCmd::Intersects => "intersects",
        }
    }
}

/// The geometric side of a fence.
#[derive(Debug, Clone)]
pub enum FenceArea {
    /// NEARBY: a center plus radius.
    Center { lat: f64, lon: f64, meters: f64 },
    /// WITHIN/INTERSECTS: an area object (bounds included).
    Shape(Object),
    /// Roaming: the area is other objects of a target collection.
    Roam(RoamSpec),
}

#[derive(Debug, Clone)]
pub struct RoamSpec {
    pub key: String,
    pub pattern: String,
    pub meters: f64,
    /// Optional glob over the target collection included with each event.
    pub scan: Option<String>,
}

/// A compiled fence query: the predicate bound to a hook or to a live
/// fence connection.
#[derive(Debug, Clone)]
pub struct FenceSpec {
    pub cmd: FenceCmd,
    pub key: String,
    pub glob: String,
    pub wheres: Vec<Where>,
    pub nofields: bool,
    pub detect: Option<std::collections::HashSet<String>>,
    pub commands: Option<std::collections::HashSet<String>>,
    pub output: SearchOutput,
    pub area: FenceArea,
}

impl FenceSpec {
    fn detect_wanted(&self, kind: &str) -> bool {
        match &self.detect {
            Some(set) => set.contains(kind),
            None => true,
        }
    }

    fn command_wanted(&self, command: &str) -> bool {
        match &self.commands {
            Some(set) => set.contains(command),
            None => true,
        }
    }

    fn search_options(&self) -> SearchOptions {
        SearchOptions {
            key: self.key.clone(),
            cursor: 0,
            limit: u64::MAX,
            sparse: 0,
            glob: String::new(),
            wheres: self.wheres.clone(),
            nofields: self.nofields,
            fence: true,
            desc: false,
            detect: self.detect.clone(),
            commands: self.commands.clone(),
            output: self.output,
        }
    }
}

/// Evaluate one mutation against one fence. Returns the JSON messages to
/// deliver, in order. `groups` is the subscriber's `(key,id) -> group`
/// map; fresh groups are allocated from the database counter.
pub fn fence_match(
    db: &Db,
    hook_name: Option<&str>,
    spec: &FenceSpec,
    groups: &mut HashMap<(String, String), u64>,
    details: &CommandDetails,
) -> Vec<String> {
    // Hook deliveries carry the hook name; direct fence connections do
    // not.
    let hook_member = match hook_name {
        Some(name) => format!("\"hook\":{},", json_string(name)),
        None => String::new(),
    };
    let js_time = json_string(
        &details
            .timestamp
            .to_rfc3339_opts(SecondsFormat::Nanos, true),
    );

    if details.command == "drop" {
        groups.clear();
        return vec![format!(
            "{{\"command\":\"drop\",{hook_member}\"time\":{js_time}}}"
        )];
    }

    if !spec.glob.is_empty() && spec.glob != "*" && !glob_match(&spec.glob, &details.id) {
        return Vec::new();
    }

    if details.command == "del" {
        groups.remove(&(details.key.clone(), details.id.clone()));
        if !spec.command_wanted("del") {
            return Vec::new();
        }
        return vec![format!(
            "{{\"command\":\"del\",{hook_member}\"key\":{},\"id\":{},\"time\":{js_time}}}",
            json_string(&details.key),
            json_string(&details.id)
        )];
    }

    let Some(obj) = &details.obj else {
        return Vec::new();
    };
    if !obj.is_geometry() || (details.command == "fset" && spec.nofields) {
        return Vec::new();
    }

    // Roam fences and containment fences compute the detect kind
    // differently.
    let mut roam_hits: Vec<RoamHit> = Vec::new();
    let detect: &str;
    if let FenceArea::Roam(roam) = &spec.area {
        if details.command != "set" {
            return Vec::new();
        }
        roam_hits = roam_matches(db, roam, &details.key, &details.id, obj);
        if roam_hits.is_empty() {
            return Vec::new();
        }
        detect = "roam";
    } else {
        let in_before = fence_match_object(spec, details.old_obj.as_ref());
        let in_after = fence_match_object(spec, Some(obj));
        if in_before && in_after {
            detect = "inside";
        } else if in_before && !in_after {
            detect = "exit";
        } else if !in_before && in_after {
            detect = if details.command == "fset" {
                "inside"
            } else {
                "enter"
            };
        } else if details.command != "fset" && crossed_area(spec, details.old_obj.as_ref(), obj) {
            detect = "cross";
        } else {
            return Vec::new();
        }
    }

    if !spec.command_wanted(&details.command) {
        return Vec::new();
    }

    // Group id: fresh on enter/cross, persistent otherwise.
    let gk = (details.key.clone(), details.id.clone());
    let group = match detect {
        "enter" | "cross" => {
            let g = db.next_group();
            groups.insert(gk, g);
            g
        }
        _ => *groups.entry(gk).or_insert_with(|| db.next_group()),
    };

    // Render the item fragment the way searches render it.
    let mut sw = ScanWriter::for_fence(details.field_map.clone(), &spec.search_options());
    sw.write_object(&details.id, obj, &details.fields);
    let fragment = sw.take_fragment();
    if fragment.is_empty() || !fragment.starts_with('{') {
        return Vec::new();
    }
    let body = &fragment[1..]; // after '{'

    let js_key = json_string(&details.key);
    let envelope = |kind: &str| {
        format!(
            "{{\"command\":\"{}\",\"group\":\"{}\",\"detect\":\"{}\",{}\"key\":{},\"time\":{},{}",
            details.command, group, kind, hook_member, js_key, js_time, body
        )
    };

    let mut msgs = Vec::with_capacity(2);
    if spec.detect_wanted(detect) {
        msgs.push(envelope(detect));
    }
    match detect {
        "enter" => {
            if spec.detect_wanted("inside") {
                msgs.push(envelope("inside"));
            }
        }
        "exit" | "cross" => {
            if spec.detect_wanted("outside") {
                msgs.push(envelope("outside"));
            }
        }
        "roam" => {
            if let Some(base) = msgs.first().cloned() {
                let trimmed = &base[..base.len() - 1]; // drop trailing '}'
                msgs = roam_hits
                    .iter()
                    .map(|hit| {
                        let mut m = format!(
                            "{},\"nearby\":{{\"key\":{},\"id\":{},\"meters\":{}}}",
                            trimmed,
                            json_string(&hit.key),
                            json_string(&hit.id),
                            hit.meters
                        );
                        if let Some(scan) = &hit.scan {
                            m.push_str(",\"scan\":");
                            m.push_str(scan);
                        }
                        m.push('}');
                        m
                    })
                    .collect();
            }
        }
        _ => {}
    }
    msgs
}

fn fence_match_object(spec: &FenceSpec, obj: Option<&Object>) -> bool {
    let Some(obj) = obj else {
        return false;
    };
    match &spec.area {
        FenceArea::Roam(_) => false,
        FenceArea::Center { lat, lon, meters } => obj.nearby(*lat, *lon, *meters),
        FenceArea::Shape(area) => match spec.cmd {
            FenceCmd::Within => obj.within(area),
            _ => obj.intersects(area),
        },
    }
}

/// Both endpoints were outside: did the movement segment cut the area?
fn crossed_area(spec: &FenceSpec, old: Option<&Object>, new: &Object) -> bool {
    let Some(op) = old.and_then(|o| o.point()) else {
        return false;
    };
    let Some(np) = new.point() else {
        return false;
    };
    match &spec.area {
        FenceArea::Roam(_) => false,
        FenceArea::Center { lat, lon, meters } => {
            sphere::point_to_segment_distance(*lat, *lon, op.lat, op.lon, np.lat, np.lon)
                <= *meters
        }
        // A within fence tests the crossing with intersects: the segment
        // only passes through.
        FenceArea::Shape(area) => {
            let segment = Object::Geometry(Geometry::LineString(LineString(vec![
                Coord {
                    x: op.lon,
                    y: op.lat,
                },
                Coord {
                    x: np.lon,
                    y: np.lat,
                },
            ])));
            segment.intersects(area)
        }
    }
}

struct RoamHit {
    key: String,
    id: String,
    meters: f64,
    /// Pre-rendered JSON array of matching target items.
    scan: Option<String>,
}

fn roam_matches(db: &Db, roam: &RoamSpec, tkey: &str, tid: &str, obj: &Object) -> Vec<RoamHit> {
    let mut hits = Vec::new();
    let Some(col) = db.get_col(&roam.key) else {
        return hits;
    };
    let Some(center) = obj.point() else {
        return hits;
    };
    let pattern_is_glob = is_glob(&roam.pattern);
    col.nearby(0, 0, center.lat, center.lon, roam.meters, &mut |id, other, _| {
        if roam.key == tkey && id == tid {
            return true; // skip self
        }
        let matched = if pattern_is_glob {
            glob_match(&roam.pattern, id)
        } else {
            roam.pattern == id
        };
        if matched {
            let meters = match other.point() {
                Some(p) => sphere::haversine_distance(center.lat, center.lon, p.lat, p.lon),
                None => 0.0,
            };
            hits.push(RoamHit {
                key: roam.key.clone(),
                id: id.to_string(),
                meters,
                scan: roam.scan.as_ref().map(|pat| scan_items(col, pat)),
            });
        }
        true
    });
    hits
}

/// Render the target-collection items matching the roam scan pattern.
fn scan_items(col: &meridian_collection::Collection, pattern: &str) -> String {
    let mut out = String::from("[");
    let mut first = true;
    col.scan(0, false, &mut |id, obj, _| {
        if pattern == "*" || glob_match(pattern, id) {
            if !first {
                out.push(',');
            }
            first = false;
            out.push_str(&format!(
                "{{\"id\":{},\"object\":{}}}",
                json_string(id),
                obj.json_bytes()
            ));
        }
        true
    });
    out.push(']');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aof::Aof;
    use crate::config::Config;
    use meridian_geo::GeoPoint;
    use serde_json::Value;

    fn test_db() -> Db {
        Db::new(std::env::temp_dir(), Config::default(), Aof::detached())
    }

    fn nearby_spec() -> FenceSpec {
        FenceSpec {
            cmd: FenceCmd::Nearby,
            key: "fleet".into(),
            glob: String::new(),
            wheres: Vec::new(),
            nofields: false,
            detect: None,
            commands: None,
            output: SearchOutput::Objects,
            area: FenceArea::Center {
                lat: 33.0,
                lon: -115.0,
                meters: 5000.0,
            },
        }
    }

    fn set_details(id: &str, old: Option<(f64, f64)>, new: (f64, f64)) -> CommandDetails {
        let mut d = CommandDetails::new("set", "fleet", id);
        d.obj = Some(Object::Point(GeoPoint::new(new.0, new.1)));
        d.old_obj = old.map(|(lat, lon)| Object::Point(GeoPoint::new(lat, lon)));
        d
    }

    fn detects(msgs: &[String]) -> Vec<String> {
        msgs.iter()
            .map(|m| {
                let v: Value = serde_json::from_str(m).expect("valid json");
                v["detect"].as_str().unwrap_or("").to_string()
            })
            .collect()
    }

    #[test]
    fn enter_then_inside_then_exit() {
        let db = test_db();
        let spec = nearby_spec();
        let mut groups = HashMap::new();

        let msgs = fence_match(&db, Some("h"), &spec, &mut groups, &set_details("t1", None, (33.0, -115.0)));
        assert_eq!(detects(&msgs), vec!["enter", "inside"]);
        let enter: Value = serde_json::from_str(&msgs[0]).unwrap();
        let group1 = enter["group"].as_str().unwrap().to_string();
        assert!(!group1.is_empty());

        // Moving inside keeps the same group.
        let msgs = fence_match(
            &db,
            Some("h"),
            &spec,
            &mut groups,
            &set_details("t1", Some((33.0, -115.0)), (33.001, -115.0)),
        );
        assert_eq!(detects(&msgs), vec!["inside"]);
        let inside: Value = serde_json::from_str(&msgs[0]).unwrap();
        assert_eq!(inside["group"].as_str().unwrap(), group1);

        // Leaving emits exit + outside.
        let msgs = fence_match(
            &db,
            Some("h"),
            &spec,
            &mut groups,
            &set_details("t1", Some((33.001, -115.0)), (34.0, -115.0)),
        );
        assert_eq!(detects(&msgs), vec!["exit", "outside"]);

        // Re-entering allocates a fresh group.
        let msgs = fence_match(
            &db,
            Some("h"),
            &spec,
            &mut groups,
            &set_details("t1", Some((34.0, -115.0)), (33.0, -115.0)),
        );
        let enter2: Value = serde_json::from_str(&msgs[0]).unwrap();
        assert_ne!(enter2["group"].as_str().unwrap(), group1);
    }

    #[test]
    fn outside_to_outside_is_silent() {
        let db = test_db();
        let spec = nearby_spec();
        let mut groups = HashMap::new();
        let msgs = fence_match(
            &db,
            Some("h"),
            &spec,
            &mut groups,
            &set_details("t1", Some((40.0, -115.0)), (41.0, -115.0)),
        );
        assert!(msgs.is_empty());
    }

    #[test]
    fn crossing_emits_cross_and_outside() {
        let db = test_db();
        let spec = nearby_spec();
        let mut groups = HashMap::new();
        // South of the fence to north of it in one jump: the segment
        // passes through the circle.
        let msgs = fence_match(
            &db,
            Some("h"),
            &spec,
            &mut groups,
            &set_details("t1", Some((32.0, -115.0)), (34.0, -115.0)),
        );
        assert_eq!(detects(&msgs), vec!["cross", "outside"]);
    }

    #[test]
    fn detect_filter_restricts_kinds() {
        let db = test_db();
        let mut spec = nearby_spec();
        let mut set = std::collections::HashSet::new();
        set.insert("exit".to_string());
        spec.detect = Some(set);
        let mut groups = HashMap::new();

        let msgs = fence_match(&db, Some("h"), &spec, &mut groups, &set_details("t1", None, (33.0, -115.0)));
        assert!(msgs.is_empty(), "enter/inside are filtered: {msgs:?}");

        let msgs = fence_match(
            &db,
            Some("h"),
            &spec,
            &mut groups,
            &set_details("t1", Some((33.0, -115.0)), (40.0, -115.0)),
        );
        assert_eq!(detects(&msgs), vec!["exit"]);
    }

    #[test]
    fn glob_filters_ids() {
        let db = test_db();
        let mut spec = nearby_spec();
        spec.glob = "truck*".into();
        let mut groups = HashMap::new();
        let msgs = fence_match(&db, Some("h"), &spec, &mut groups, &set_details("car1", None, (33.0, -115.0)));
        assert!(msgs.is_empty());
        let msgs = fence_match(&db, Some("h"), &spec, &mut groups, &set_details("truck1", None, (33.0, -115.0)));
        assert!(!msgs.is_empty());
    }

    #[test]
    fn del_and_drop_messages() {
        let db = test_db();
        let spec = nearby_spec();
        let mut groups = HashMap::new();
        groups.insert(("fleet".to_string(), "t1".to_string()), 9);

        let d = CommandDetails::new("del", "fleet", "t1");
        let msgs = fence_match(&db, Some("h"), &spec, &mut groups, &d);
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].contains("\"command\":\"del\""));
        assert!(groups.is_empty(), "del clears the id's group");

        groups.insert(("fleet".to_string(), "t2".to_string()), 10);
        let d = CommandDetails::new("drop", "fleet", "");
        let msgs = fence_match(&db, Some("h"), &spec, &mut groups, &d);
        assert!(msgs[0].contains("\"command\":\"drop\""));
        assert!(groups.is_empty(), "drop clears all groups");
    }

    #[test]
    fn fset_never_reports_enter() {
        let db = test_db();
        let spec = nearby_spec();
        let mut groups = HashMap::new();
        let mut d = set_details("t1", None, (33.0, -115.0));
        d.command = "fset".to_string();
        let msgs = fence_match(&db, Some("h"), &spec, &mut groups, &d);
        assert_eq!(detects(&msgs), vec!["inside"]);
    }

    #[test]
    fn roam_detects_nearby_target() {
        let mut db = test_db();
        let col = db.get_or_create_col("fleet");
        col.upsert("other", Object::Point(GeoPoint::new(33.0005, -115.0)), &[]);

        let mut spec = nearby_spec();
        spec.area = FenceArea::Roam(RoamSpec {
            key: "fleet".into(),
            pattern: "*".into(),
            meters: 1000.0,
            scan: None,
        });
        let mut groups = HashMap::new();
        let msgs = fence_match(&db, Some("h"), &spec, &mut groups, &set_details("me", None, (33.0, -115.0)));
        assert_eq!(msgs.len(), 1);
        let v: Value = serde_json::from_str(&msgs[0]).unwrap();
        assert_eq!(v["detect"], "roam");
        assert_eq!(v["nearby"]["id"], "other");
        assert!(v["nearby"]["meters"].as_f64().unwrap() > 0.0);

        // Far away target: no event.
        let msgs = fence_match(&db, Some("h"), &spec, &mut groups, &set_details("me", None, (40.0, -115.0)));
        assert!(msgs.is_empty());
    }
}
