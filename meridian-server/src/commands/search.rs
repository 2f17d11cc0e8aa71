//! Spatial search commands: NEARBY, WITHIN, INTERSECTS.
//!
//! A FENCE-bearing search does not run at all: it compiles into a
//! [`FenceSpec`] and the engine hands the connection to the live
//! dispatcher.

use std::time::Instant;

use meridian_geo::Object;

use crate::args::{parse_area, parse_search_options, AreaSpec, Args, SearchOptions};
use crate::commands::elapsed;
use crate::db::Db;
use crate::error::{Result, ServerError};
use crate::fence::{FenceArea, FenceCmd, FenceSpec, RoamSpec};
use crate::protocol::{Message, Reply};
use crate::scan_writer::ScanWriter;

const NEARBY_TYPES: [&str; 2] = ["point", "roam"];
const WITHIN_TYPES: [&str; 6] = ["get", "bounds", "object", "tile", "quadkey", "hash"];

/// Either a finished reply or a compiled fence subscription.
pub enum SearchOutcome {
    Reply(Reply),
    Fence(FenceSpec),
}

pub fn cmd_nearby(db: &Db, msg: &Message, start: Instant) -> Result<SearchOutcome> {
    let mut args = Args::new(&msg.args);
    let opts = parse_search_options("nearby", &mut args)?;
    let area = parse_area("nearby", &mut args, &NEARBY_TYPES)?;

    if opts.fence {
        return Ok(SearchOutcome::Fence(compile_fence(
            db,
            FenceCmd::Nearby,
            &opts,
            area,
        )?));
    }
    let AreaSpec::Point { lat, lon, meters } = area else {
        return Err(ServerError::other("ROAM requires FENCE"));
    };

    let mut sw = new_writer(db, &opts);
    let mut body = String::from("{\"ok\":true");
    sw.write_head();
    let mut cursor = opts.cursor;
    if let Some(col) = db.get_col(&opts.key) {
        cursor = col.nearby(opts.cursor, opts.sparse, lat, lon, meters, &mut |id, o, f| {
            sw.write_object(id, o, f)
        });
    }
    sw.write_foot(cursor);
    body.push_str(sw.body());
    body.push_str(&format!(",\"elapsed\":\"{}\"}}", elapsed(start)));
    Ok(SearchOutcome::Reply(Reply::json(body)))
}

pub fn cmd_within(db: &Db, msg: &Message, start: Instant) -> Result<SearchOutcome> {
    within_or_intersects(db, msg, start, FenceCmd::Within)
}

pub fn cmd_intersects(db: &Db, msg: &Message, start: Instant) -> Result<SearchOutcome> {
    within_or_intersects(db, msg, start, FenceCmd::Intersects)
}

fn within_or_intersects(
    db: &Db,
    msg: &Message,
    start: Instant,
    cmd: FenceCmd,
) -> Result<SearchOutcome> {
    let mut args = Args::new(&msg.args);
    let opts = parse_search_options(cmd.name(), &mut args)?;
    let area = parse_area(cmd.name(), &mut args, &WITHIN_TYPES)?;

    if opts.fence {
        return Ok(SearchOutcome::Fence(compile_fence(db, cmd, &opts, area)?));
    }
    let area = resolve_area(db, area)?;

    let mut sw = new_writer(db, &opts);
    let mut body = String::from("{\"ok\":true");
    sw.write_head();
    let mut cursor = opts.cursor;
    if let Some(col) = db.get_col(&opts.key) {
        let visit = &mut |id: &str, o: &Object, f: &[f64]| sw.write_object(id, o, f);
        cursor = match cmd {
            FenceCmd::Within => col.within(opts.cursor, opts.sparse, &area, visit),
            _ => col.intersects(opts.cursor, opts.sparse, &area, visit),
        };
    }
    sw.write_foot(cursor);
    body.push_str(sw.body());
    body.push_str(&format!(",\"elapsed\":\"{}\"}}", elapsed(start)));
    Ok(SearchOutcome::Reply(Reply::json(body)))
}

fn new_writer(db: &Db, opts: &SearchOptions) -> ScanWriter {
    let (fmap, farr) = match db.get_col(&opts.key) {
        Some(col) => (col.field_map().clone(), col.field_arr()),
        None => Default::default(),
    };
    ScanWriter::new(fmap, farr, opts)
}

/// Resolve an [`AreaSpec`] into a concrete object, looking up GET areas.
pub fn resolve_area(db: &Db, area: AreaSpec) -> Result<Object> {
    Ok(match area {
        AreaSpec::Bounds(b) => Object::Bounds(b),
        AreaSpec::Object(o) => o,
        AreaSpec::Get { key, id } => {
            let col = db.get_col(&key).ok_or(ServerError::KeyNotFound)?;
            let (obj, _) = col.get(&id).ok_or(ServerError::IdNotFound)?;
            obj.clone()
        }
        AreaSpec::Point { .. } | AreaSpec::Roam { .. } => {
            return Err(ServerError::other("invalid area"))
        }
    })
}

/// Compile a FENCE-bearing search into the spec the dispatcher evaluates.
pub fn compile_fence(
    db: &Db,
    cmd: FenceCmd,
    opts: &SearchOptions,
    area: AreaSpec,
) -> Result<FenceSpec> {
    let area = match area {
        AreaSpec::Point { lat, lon, meters } => FenceArea::Center { lat, lon, meters },
        AreaSpec::Roam {
            key,
            pattern,
            meters,
            scan,
        } => FenceArea::Roam(RoamSpec {
            key,
            pattern,
            meters,
            scan,
        }),
        other => FenceArea::Shape(resolve_area(db, other)?),
    };
    Ok(FenceSpec {
        cmd,
        key: opts.key.clone(),
        glob: opts.glob.clone(),
        wheres: opts.wheres.clone(),
        nofields: opts.nofields,
        detect: opts.detect.clone(),
        commands: opts.commands.clone(),
        output: opts.output,
        area,
    })
}
