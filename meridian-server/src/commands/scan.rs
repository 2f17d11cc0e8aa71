//! Listing and introspection commands: KEYS, SCAN, BOUNDS, STATS, SERVER.

use std::time::Instant;

use crate::args::{parse_search_options, Args};
use crate::commands::elapsed;
use crate::db::Db;
use crate::error::{Result, ServerError};
use crate::glob::glob_match;
use crate::protocol::{json_string, Message, Reply, RespValue};
use crate::scan_writer::{bounds_json, ScanWriter};

/// `KEYS pattern`: collection keys matching a glob, sorted.
pub fn cmd_keys(db: &Db, msg: &Message, start: Instant) -> Result<Reply> {
    let mut args = Args::new(&msg.args);
    let pattern = args.next()?.to_string();
    args.expect_end()?;

    let mut body = String::from("{\"ok\":true,\"keys\":[");
    let mut vals = Vec::new();
    let mut first = true;
    for key in db.collections.keys() {
        if pattern == "*" || glob_match(&pattern, key) {
            if !first {
                body.push(',');
            }
            first = false;
            body.push_str(&json_string(key));
            vals.push(RespValue::Bulk(key.clone()));
        }
    }
    body.push_str(&format!("],\"elapsed\":\"{}\"}}", elapsed(start)));
    Ok(Reply::json(body).with_resp(RespValue::Array(vals)))
}

/// `SCAN key [CURSOR n] [LIMIT n] [MATCH glob] [WHERE ...]* [ASC|DESC]
/// [COUNT|IDS|OBJECTS|POINTS|BOUNDS|HASHES p]`
pub fn cmd_scan(db: &Db, msg: &Message, start: Instant) -> Result<Reply> {
    let mut args = Args::new(&msg.args);
    let opts = parse_search_options("scan", &mut args)?;
    args.expect_end()?;

    let col = db.get_col(&opts.key);
    let (fmap, farr) = match col {
        Some(c) => (c.field_map().clone(), c.field_arr()),
        None => Default::default(),
    };
    let mut sw = ScanWriter::new(fmap, farr, &opts);
    let mut body = String::from("{\"ok\":true");
    sw.write_head();
    let mut cursor = opts.cursor;
    if let Some(col) = col {
        cursor = col.scan(opts.cursor, opts.desc, &mut |id, o, f| {
            sw.write_object(id, o, f)
        });
    }
    sw.write_foot(cursor);
    body.push_str(sw.body());
    body.push_str(&format!(",\"elapsed\":\"{}\"}}", elapsed(start)));
    Ok(Reply::json(body))
}

/// `BOUNDS key`: union box of every geometric object under the key.
pub fn cmd_bounds(db: &Db, msg: &Message, start: Instant) -> Result<Reply> {
    let mut args = Args::new(&msg.args);
    let key = args.next()?.to_string();
    args.expect_end()?;

    let col = db.get_col(&key).ok_or(ServerError::KeyNotFound)?;
    let body = format!(
        "{{\"ok\":true,\"bounds\":{},\"elapsed\":\"{}\"}}",
        bounds_json(col.bounds()),
        elapsed(start)
    );
    Ok(Reply::json(body))
}

/// `STATS key [key ...]`: per-key counters; null for unknown keys.
pub fn cmd_stats(db: &Db, msg: &Message, start: Instant) -> Result<Reply> {
    let mut args = Args::new(&msg.args);
    let mut entries: Vec<String> = Vec::new();
    let mut vals: Vec<RespValue> = Vec::new();
    let mut any = false;
    while let Some(key) = args.take() {
        any = true;
        match db.get_col(key) {
            Some(col) => {
                entries.push(format!(
                    "{{\"in_memory_size\":{},\"num_objects\":{},\"num_points\":{}}}",
                    col.total_weight(),
                    col.count(),
                    col.point_count()
                ));
                vals.push(resp_simple_map(&[
                    ("in_memory_size", col.total_weight().to_string()),
                    ("num_objects", col.count().to_string()),
                    ("num_points", col.point_count().to_string()),
                ]));
            }
            None => {
                entries.push("null".to_string());
                vals.push(RespValue::Null);
            }
        }
    }
    if !any {
        return Err(ServerError::InvalidNumArgs);
    }
    let body = format!(
        "{{\"ok\":true,\"stats\":[{}],\"elapsed\":\"{}\"}}",
        entries.join(","),
        elapsed(start)
    );
    Ok(Reply::json(body).with_resp(RespValue::Array(vals)))
}

/// Key/value pairs as a flat RESP array, the classic simple-map shape.
fn resp_simple_map(pairs: &[(&str, String)]) -> RespValue {
    let mut vals = Vec::with_capacity(pairs.len() * 2);
    for (k, v) in pairs {
        vals.push(RespValue::Bulk(k.to_string()));
        vals.push(RespValue::Bulk(v.clone()));
    }
    RespValue::Array(vals)
}

/// `SERVER`: process-wide stats, including replication state.
pub fn cmd_server(db: &Db, msg: &Message, start: Instant) -> Result<Reply> {
    Args::new(&msg.args).expect_end()?;

    let mut points = 0usize;
    let mut objects = 0usize;
    let mut size = 0usize;
    for col in db.collections.values() {
        points += col.point_count();
        objects += col.count();
        size += col.total_weight();
    }

    let mut stats = serde_json::Map::new();
    stats.insert("id".into(), db.config.server_id.clone().into());
    if let (Some(host), Some(port)) = (&db.config.follow_host, db.config.follow_port) {
        stats.insert("following".into(), format!("{host}:{port}").into());
        stats.insert("caught_up".into(), db.caught_up.into());
    }
    stats.insert("aof_size".into(), db.aof.size.into());
    stats.insert("num_collections".into(), db.collections.len().into());
    stats.insert("num_hooks".into(), db.hooks.len().into());
    stats.insert("num_points".into(), points.into());
    stats.insert("num_objects".into(), objects.into());
    stats.insert("in_memory_size".into(), size.into());
    stats.insert("read_only".into(), db.config.read_only.into());

    let pairs: Vec<(&str, String)> = stats
        .iter()
        .map(|(k, v)| {
            let text = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.as_str(), text)
        })
        .collect();
    let resp = resp_simple_map(&pairs);
    let body = format!(
        "{{\"ok\":true,\"stats\":{},\"elapsed\":\"{}\"}}",
        serde_json::Value::Object(stats),
        elapsed(start)
    );
    Ok(Reply::json(body).with_resp(resp))
}
