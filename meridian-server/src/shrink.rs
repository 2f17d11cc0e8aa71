//! Online log shrink.
//!
//! Builds a minimal equivalent log from live state while the server keeps
//! serving: one synthetic SET per stored item (zero-valued fields
//! omitted) plus one SETHOOK per hook, then the tail of writes that
//! landed during the rewrite, then an atomic rename. Lock holds are
//! bounded by small key/id batches.

use std::io::{Seek, SeekFrom, Write};
use std::ops::Bound;
use std::sync::Arc;
use std::time::Instant;

use meridian_geo::Object;

use crate::error::Result;
use crate::protocol::encode_frame;
use crate::server::ServerInner;

/// Keys fetched per lock hold.
const KEY_BATCH: usize = 10;
/// Items fetched per lock hold.
const ID_BATCH: usize = 10;

/// Run a shrink to completion. A second concurrent call is a no-op.
pub async fn aofshrink(inner: Arc<ServerInner>) {
    let endpos = {
        let mut db = inner.db.write().await;
        if db.aof.shrinking {
            return;
        }
        db.aof.shrinking = true;
        if let Err(e) = db.aof.sync() {
            tracing::error!(error = %e, "log sync failed before shrink");
            db.aof.shrinking = false;
            return;
        }
        db.aof.size
    };
    let start = Instant::now();
    tracing::info!(endpos, "log shrink started");

    let result = do_shrink(&inner, endpos).await;

    {
        let mut db = inner.db.write().await;
        db.aof.shrinking = false;
        let _ = std::fs::remove_file(db.dir.join("shrink"));
    }
    match result {
        Ok(()) => tracing::info!(elapsed = ?start.elapsed(), "log shrink completed"),
        Err(e) => tracing::error!(error = %e, "log shrink failed"),
    }
}

async fn do_shrink(inner: &Arc<ServerInner>, endpos: u64) -> Result<()> {
    let dir = {
        let db = inner.db.read().await;
        db.dir.clone()
    };
    let shrink_path = dir.join("shrink");
    let mut out = std::fs::File::create(&shrink_path)?;

    // Dump every collection as synthetic SETs, a short lock hold per
    // batch.
    let mut last_key = String::new();
    loop {
        let keys: Vec<String> = {
            let db = inner.db.write().await;
            db.collections
                .range::<String, _>((Bound::Excluded(last_key.clone()), Bound::Unbounded))
                .take(KEY_BATCH)
                .map(|(k, _)| k.clone())
                .collect()
        };
        let Some(tail_key) = keys.last().cloned() else {
            break;
        };
        for key in keys {
            dump_collection(inner, &key, &mut out).await?;
        }
        last_key = tail_key;
    }

    // Hooks, in name order.
    {
        let db = inner.db.read().await;
        let mut names: Vec<&String> = db.hooks.keys().collect();
        names.sort();
        for name in names {
            out.write_all(&encode_frame(&db.hooks[name].message))?;
        }
    }

    // Finale: catch up the tail written during the dump, point followers
    // at a fresh sync, and swap the files.
    let mut db = inner.db.write().await;
    out.sync_all()?;
    db.aof.sync()?;
    {
        let mut live = std::fs::File::open(db.aof.path())?;
        live.seek(SeekFrom::Start(endpos))?;
        std::io::copy(&mut live, &mut out)?;
        out.sync_all()?;
    }
    // Written to the old log only: tailing followers see it and
    // reconnect against the rewritten file.
    let _ = db.aof.append_frame(&["KILLAOF".to_string()]);
    inner.new_data.notify_waiters();
    drop(out);

    if let Err(e) = std::fs::rename(&shrink_path, db.aof.path()) {
        tracing::error!(error = %e, "shrink rename failed, manual recovery required");
        std::process::exit(1);
    }
    db.aof.reopen()?;
    tracing::info!(size = db.aof.size, "log rewritten");
    Ok(())
}

/// Dump one collection in id batches under short lock holds.
async fn dump_collection(
    inner: &Arc<ServerInner>,
    key: &str,
    out: &mut std::fs::File,
) -> Result<()> {
    let mut lower = String::new();
    loop {
        let batch: Vec<Vec<String>> = {
            let db = inner.db.write().await;
            let Some(col) = db.get_col(key) else {
                return Ok(()); // dropped mid-shrink
            };
            let fmap = col.field_map().clone();
            let mut frames = Vec::with_capacity(ID_BATCH);
            col.scan_range(0, &lower, "", false, &mut |id, obj, fields| {
                frames.push(set_frame_args(key, id, obj, &fmap, fields));
                frames.len() < ID_BATCH
            });
            frames
        };
        let Some(last) = batch.last() else {
            return Ok(());
        };
        // args[2] is the id; resume past it on the next hold.
        lower = format!("{}\u{0}", last[2]);
        let full = batch.len() == ID_BATCH;
        for args in &batch {
            out.write_all(&encode_frame(args))?;
        }
        if !full {
            return Ok(());
        }
    }
}

/// Synthesize `SET key id [FIELD name value]* <type...>` for one item.
fn set_frame_args(
    key: &str,
    id: &str,
    obj: &Object,
    fmap: &std::collections::HashMap<String, usize>,
    fields: &[f64],
) -> Vec<String> {
    let mut args: Vec<String> = vec!["set".into(), key.into(), id.into()];
    let mut named: Vec<(&str, f64)> = Vec::new();
    for (name, &idx) in fmap {
        if let Some(&v) = fields.get(idx) {
            // A zero is indistinguishable from absent at read time.
            if !v.is_nan() && v != 0.0 {
                named.push((name, v));
            }
        }
    }
    named.sort_by(|a, b| a.0.cmp(b.0));
    for (name, value) in named {
        args.push("field".into());
        args.push(name.to_string());
        args.push(format!("{value}"));
    }
    match obj {
        Object::Point(p) => {
            args.push("point".into());
            args.push(format!("{}", p.lat));
            args.push(format!("{}", p.lon));
            if let Some(z) = p.z {
                args.push(format!("{z}"));
            }
        }
        Object::Bounds(b) => {
            args.push("bounds".into());
            for v in [b.min_lat, b.min_lon, b.max_lat, b.max_lon] {
                args.push(format!("{v}"));
            }
        }
        Object::String(s) => {
            args.push("string".into());
            args.push(s.clone());
        }
        other => {
            args.push("object".into());
            args.push(other.json_bytes());
        }
    }
    args
}
