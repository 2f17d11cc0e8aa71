//! Data commands: SET, FSET, GET, DEL, DROP, FLUSHDB, EXPIRE, PERSIST,
//! TTL.

use std::time::{Duration, Instant};

use meridian_geo::{geohash, BBox, GeoPoint, Object};

use crate::args::{parse_f64, Args};
use crate::commands::{elapsed, WriteResult};
use crate::db::{named_fields, CommandDetails, Db, Undo};
use crate::error::{Result, ServerError};
use crate::protocol::{json_string, Message, Reply, RespValue};
use crate::scan_writer::{bounds_json, point_json};

/// Field names that collide with the coordinate members of replies.
fn is_reserved_field(name: &str) -> bool {
    matches!(name, "z" | "lat" | "lon")
}

/// The parsed body of a SET command.
pub struct SetArgs {
    pub key: String,
    pub id: String,
    pub fields: Vec<(String, f64)>,
    pub ex: Option<f64>,
    pub obj: Object,
}

/// Parse `SET key id [FIELD name value]* [EX seconds] <type args...>`.
pub fn parse_set_args(msg: &Message) -> Result<SetArgs> {
    let mut args = Args::new(&msg.args);
    let key = args.next()?.to_string();
    let id = args.next()?.to_string();
    let mut fields = Vec::new();
    let mut ex = None;

    loop {
        let tok = args.next()?;
        let lower = tok.to_ascii_lowercase();
        match lower.as_str() {
            "field" => {
                let name = args.next()?.to_string();
                if is_reserved_field(&name) {
                    return Err(ServerError::invalid_argument(name));
                }
                let value = args.next_f64()?;
                fields.push((name, value));
            }
            "ex" => {
                let seconds = args.next_f64()?;
                if seconds < 0.0 {
                    return Err(ServerError::invalid_argument(seconds.to_string()));
                }
                ex = Some(seconds);
            }
            "point" => {
                let lat = args.next_f64()?;
                let lon = args.next_f64()?;
                let obj = match args.take() {
                    Some(z) => Object::Point(GeoPoint::with_z(lat, lon, parse_f64(z)?)),
                    None => Object::Point(GeoPoint::new(lat, lon)),
                };
                args.expect_end()?;
                return Ok(SetArgs {
                    key,
                    id,
                    fields,
                    ex,
                    obj,
                });
            }
            "bounds" => {
                let min_lat = args.next_f64()?;
                let min_lon = args.next_f64()?;
                let max_lat = args.next_f64()?;
                let max_lon = args.next_f64()?;
                args.expect_end()?;
                return Ok(SetArgs {
                    key,
                    id,
                    fields,
                    ex,
                    obj: Object::Bounds(BBox::new(min_lat, min_lon, max_lat, max_lon)),
                });
            }
            "hash" => {
                let hash = args.next()?;
                let (lat, lon) = geohash::decode(hash)?;
                args.expect_end()?;
                return Ok(SetArgs {
                    key,
                    id,
                    fields,
                    ex,
                    obj: Object::Point(GeoPoint::new(lat, lon)),
                });
            }
            "object" => {
                let body = args.rest_joined();
                if body.is_empty() {
                    return Err(ServerError::InvalidNumArgs);
                }
                return Ok(SetArgs {
                    key,
                    id,
                    fields,
                    ex,
                    obj: Object::from_json(&body)?,
                });
            }
            "string" => {
                let value = args.next()?.to_string();
                args.expect_end()?;
                return Ok(SetArgs {
                    key,
                    id,
                    fields,
                    ex,
                    obj: Object::String(value),
                });
            }
            _ => return Err(ServerError::invalid_argument(tok)),
        }
    }
}

pub fn cmd_set(db: &mut Db, msg: &Message, start: Instant) -> Result<WriteResult> {
    let parsed = parse_set_args(msg)?;
    let SetArgs {
        key,
        id,
        fields,
        ex,
        obj,
    } = parsed;

    let col = db.get_or_create_col(&key);
    let (old_obj, old_fields, new_fields) = col.upsert(&id, obj.clone(), &fields);
    let field_map = col.field_map().clone();

    // EX replaces any prior deadline; a SET without EX clears it.
    db.expires.clear(&key, &id);
    if let Some(seconds) = ex {
        db.expires
            .expire_at(&key, &id, Instant::now() + Duration::from_secs_f64(seconds));
    }

    let undo = match &old_obj {
        Some(prev) => Undo::Reinsert {
            key: key.clone(),
            id: id.clone(),
            object: prev.clone(),
            fields: named_fields(&field_map, old_fields.as_deref().unwrap_or(&[])),
        },
        None => Undo::Unset {
            key: key.clone(),
            id: id.clone(),
        },
    };

    let mut details = CommandDetails::new("set", &key, &id);
    details.obj = Some(obj);
    details.fields = new_fields;
    details.old_obj = old_obj;
    details.old_fields = old_fields.unwrap_or_default();
    details.field_map = field_map;

    Ok(WriteResult::new(
        Reply::ok(&elapsed(start)),
        Some(details),
        undo,
    ))
}

pub fn cmd_fset(db: &mut Db, msg: &Message, start: Instant) -> Result<WriteResult> {
    let mut args = Args::new(&msg.args);
    let key = args.next()?.to_string();
    let id = args.next()?.to_string();
    let name = args.next()?.to_string();
    if is_reserved_field(&name) {
        return Err(ServerError::invalid_argument(name));
    }
    let value = args.next_f64()?;
    args.expect_end()?;

    let col = db.get_col_mut(&key).ok_or(ServerError::KeyNotFound)?;
    let prior = col
        .get(&id)
        .map(|(o, f)| (o.clone(), f.to_vec()))
        .ok_or(ServerError::IdNotFound)?;
    let (obj, fields, updated) = col
        .set_field(&id, &name, value)
        .ok_or(ServerError::IdNotFound)?;
    let field_map = col.field_map().clone();

    let undo = Undo::Reinsert {
        key: key.clone(),
        id: id.clone(),
        object: prior.0.clone(),
        fields: named_fields(&field_map, &prior.1),
    };

    let mut details = CommandDetails::new("fset", &key, &id);
    details.obj = Some(obj);
    details.fields = fields;
    details.old_obj = Some(prior.0);
    details.old_fields = prior.1;
    details.field_map = field_map;
    details.updated = updated;

    let reply = Reply::ok(&elapsed(start)).with_resp(RespValue::Integer(updated as i64));
    Ok(WriteResult::new(reply, Some(details), undo))
}

pub fn cmd_del(db: &mut Db, msg: &Message, start: Instant) -> Result<WriteResult> {
    let mut args = Args::new(&msg.args);
    let key = args.next()?.to_string();
    let id = args.next()?.to_string();
    args.expect_end()?;

    let col = db.get_col_mut(&key).ok_or(ServerError::KeyNotFound)?;
    let (obj, fields) = col.remove(&id).ok_or(ServerError::IdNotFound)?;
    let field_map = col.field_map().clone();
    if col.count() == 0 {
        db.delete_col(&key);
    }
    db.expires.clear(&key, &id);

    let undo = Undo::Restore {
        key: key.clone(),
        id: id.clone(),
        object: obj.clone(),
        fields: named_fields(&field_map, &fields),
    };

    let mut details = CommandDetails::new("del", &key, &id);
    details.old_obj = Some(obj);
    details.old_fields = fields;
    details.field_map = field_map;

    Ok(WriteResult::new(
        Reply::ok(&elapsed(start)),
        Some(details),
        undo,
    ))
}

pub fn cmd_drop(db: &mut Db, msg: &Message, start: Instant) -> Result<WriteResult> {
    let mut args = Args::new(&msg.args);
    let key = args.next()?.to_string();
    args.expect_end()?;

    let existed = db.delete_col(&key).is_some();
    db.expires.clear_key(&key);

    let details = if existed {
        Some(CommandDetails::new("drop", &key, ""))
    } else {
        None
    };
    let reply = Reply::ok(&elapsed(start)).with_resp(RespValue::Integer(existed as i64));
    Ok(WriteResult::new(reply, details, Undo::None))
}

pub fn cmd_flushdb(db: &mut Db, msg: &Message, start: Instant) -> Result<WriteResult> {
    Args::new(&msg.args).expect_end()?;
    db.collections.clear();
    db.hooks.clear();
    db.hooks_by_key.clear();
    db.expires.clear_all();
    let details = CommandDetails::new("flushdb", "", "");
    Ok(WriteResult::new(
        Reply::ok(&elapsed(start)),
        Some(details),
        Undo::None,
    ))
}

pub fn cmd_expire(db: &mut Db, msg: &Message, start: Instant) -> Result<WriteResult> {
    let mut args = Args::new(&msg.args);
    let key = args.next()?.to_string();
    let id = args.next()?.to_string();
    let seconds = args.next_f64()?;
    args.expect_end()?;
    if seconds < 0.0 {
        return Err(ServerError::invalid_argument(seconds.to_string()));
    }

    let exists = db
        .get_col(&key)
        .map(|c| c.get(&id).is_some())
        .unwrap_or(false);
    if !exists {
        return Err(if db.get_col(&key).is_none() {
            ServerError::KeyNotFound
        } else {
            ServerError::IdNotFound
        });
    }
    db.expires.clear(&key, &id);
    db.expires
        .expire_at(&key, &id, Instant::now() + Duration::from_secs_f64(seconds));
    let reply = Reply::ok(&elapsed(start)).with_resp(RespValue::Integer(1));
    Ok(WriteResult::new(reply, None, Undo::None))
}

pub fn cmd_persist(db: &mut Db, msg: &Message, start: Instant) -> Result<WriteResult> {
    let mut args = Args::new(&msg.args);
    let key = args.next()?.to_string();
    let id = args.next()?.to_string();
    args.expect_end()?;

    let exists = db
        .get_col(&key)
        .map(|c| c.get(&id).is_some())
        .unwrap_or(false);
    if !exists {
        return Err(if db.get_col(&key).is_none() {
            ServerError::KeyNotFound
        } else {
            ServerError::IdNotFound
        });
    }
    let cleared = db.expires.clear(&key, &id);
    let reply = Reply::ok(&elapsed(start)).with_resp(RespValue::Integer(cleared as i64));
    Ok(WriteResult::new(reply, None, Undo::None))
}

/// `GET key id [OBJECT | POINT | BOUNDS | HASH precision] [WITHFIELDS]`
pub fn cmd_get(db: &Db, msg: &Message, start: Instant) -> Result<Reply> {
    let mut args = Args::new(&msg.args);
    let key = args.next()?.to_string();
    let id = args.next()?.to_string();

    let col = db.get_col(&key).ok_or(ServerError::KeyNotFound)?;
    let (obj, fields) = col.get(&id).ok_or(ServerError::IdNotFound)?;

    let mut body = String::from("{\"ok\":true");
    let mut withfields = false;
    let mut form: Option<String> = None;
    let mut precision: usize = 0;
    while let Some(tok) = args.take() {
        let lower = tok.to_ascii_lowercase();
        match lower.as_str() {
            "withfields" => withfields = true,
            "object" | "point" | "bounds" if form.is_none() => form = Some(lower),
            "hash" if form.is_none() => {
                form = Some(lower);
                let p = args.next()?;
                precision = p.parse().map_err(|_| ServerError::invalid_argument(p))?;
                if precision == 0 || precision > geohash::MAX_PRECISION {
                    return Err(ServerError::invalid_argument(p));
                }
            }
            _ => return Err(ServerError::invalid_argument(tok)),
        }
    }

    match form.as_deref() {
        None | Some("object") => {
            body.push_str(",\"object\":");
            body.push_str(&obj.json_bytes());
        }
        Some("point") => {
            body.push_str(",\"point\":");
            body.push_str(&point_json(obj.point()));
        }
        Some("bounds") => {
            body.push_str(",\"bounds\":");
            body.push_str(&bounds_json(obj.bbox()));
        }
        Some("hash") => {
            let hash = obj.geohash(precision)?;
            body.push_str(",\"hash\":");
            body.push_str(&json_string(&hash));
        }
        Some(other) => return Err(ServerError::invalid_argument(other)),
    }

    if withfields {
        let fmap = col.field_map();
        let mut named: Vec<(&str, f64)> = Vec::new();
        for (name, &idx) in fmap {
            if let Some(&v) = fields.get(idx) {
                if !v.is_nan() {
                    named.push((name, v));
                }
            }
        }
        if !named.is_empty() {
            named.sort_by(|a, b| a.0.cmp(b.0));
            body.push_str(",\"fields\":{");
            for (i, (n, v)) in named.iter().enumerate() {
                if i > 0 {
                    body.push(',');
                }
                body.push_str(&format!("{}:{}", json_string(n), v));
            }
            body.push('}');
        }
    }

    body.push_str(&format!(",\"elapsed\":\"{}\"}}", elapsed(start)));
    let resp = RespValue::Bulk(obj.json_bytes());
    Ok(Reply::json(body).with_resp(resp))
}

/// `TTL key id`: seconds remaining, `-1` without a deadline, `-2` when
/// the id is missing.
pub fn cmd_ttl(db: &Db, msg: &Message, start: Instant) -> Result<Reply> {
    let mut args = Args::new(&msg.args);
    let key = args.next()?.to_string();
    let id = args.next()?.to_string();
    args.expect_end()?;

    let exists = db
        .get_col(&key)
        .map(|c| c.get(&id).is_some())
        .unwrap_or(false);
    let ttl: i64 = if !exists {
        -2
    } else {
        match db.expires.ttl(&key, &id, Instant::now()) {
            Some(d) => d.as_secs() as i64,
            None => -1,
        }
    };
    let body = format!("{{\"ok\":true,\"ttl\":{ttl},\"elapsed\":\"{}\"}}", elapsed(start));
    Ok(Reply::json(body).with_resp(RespValue::Integer(ttl)))
}
