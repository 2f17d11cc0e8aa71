//! Hook registry commands: SETHOOK, DELHOOK, HOOKS.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::args::{parse_area, parse_search_options, Args};
use crate::commands::search::compile_fence;
use crate::commands::{elapsed, WriteResult};
use crate::db::{Db, Undo};
use crate::endpoint::parse_endpoints;
use crate::error::{Result, ServerError};
use crate::fence::FenceCmd;
use crate::glob::glob_match;
use crate::hook::Hook;
use crate::protocol::{json_string, Message, Reply, RespValue};

/// `SETHOOK name endpoint[,endpoint...] <NEARBY|WITHIN|INTERSECTS> key
/// ... FENCE ... <area>`
pub fn cmd_sethook(db: &mut Db, msg: &Message, start: Instant) -> Result<WriteResult> {
    let mut args = Args::new(&msg.args);
    let name = args.next()?.to_string();
    let endpoints = parse_endpoints(args.next()?)?;

    // The remainder is a search command of its own.
    let sub: Vec<String> = msg.args[3..].to_vec();
    if sub.is_empty() {
        return Err(ServerError::InvalidNumArgs);
    }
    let cmd = match sub[0].to_ascii_lowercase().as_str() {
        "nearby" => FenceCmd::Nearby,
        "within" => FenceCmd::Within,
        "intersects" => FenceCmd::Intersects,
        other => return Err(ServerError::invalid_argument(other)),
    };
    let mut sub_args = Args::new(&sub);
    let opts = parse_search_options(cmd.name(), &mut sub_args)?;
    let types: &[&str] = match cmd {
        FenceCmd::Nearby => &["point", "roam"],
        _ => &["get", "bounds", "object", "tile", "quadkey", "hash"],
    };
    let area = parse_area(cmd.name(), &mut sub_args, types)?;
    if !opts.fence {
        return Err(ServerError::other("missing FENCE argument"));
    }
    let spec = compile_fence(db, cmd, &opts, area)?;

    let hook = Hook {
        name: name.clone(),
        key: opts.key.clone(),
        endpoints,
        spec,
        message: msg.args.clone(),
        groups: Mutex::new(HashMap::new()),
    };

    // Idempotent re-install leaves the registry (and the log) untouched.
    if let Some(existing) = db.hooks.get(&name) {
        if existing.same_as(&hook) {
            let reply = Reply::ok(&elapsed(start)).with_resp(RespValue::Integer(0));
            return Ok(WriteResult::new(reply, None, Undo::None).no_append());
        }
    }
    db.install_hook(Arc::new(hook));
    let reply = Reply::ok(&elapsed(start)).with_resp(RespValue::Integer(1));
    Ok(WriteResult::new(reply, None, Undo::None))
}

/// `DELHOOK name`
pub fn cmd_delhook(db: &mut Db, msg: &Message, start: Instant) -> Result<WriteResult> {
    let mut args = Args::new(&msg.args);
    let name = args.next()?.to_string();
    args.expect_end()?;
    let removed = db.uninstall_hook(&name);
    let reply = Reply::ok(&elapsed(start)).with_resp(RespValue::Integer(removed as i64));
    Ok(WriteResult::new(reply, None, Undo::None))
}

/// `HOOKS pattern`: list hooks matching a glob, sorted by name.
pub fn cmd_hooks(db: &Db, msg: &Message, start: Instant) -> Result<Reply> {
    let mut args = Args::new(&msg.args);
    let pattern = args.next()?.to_string();
    args.expect_end()?;

    let mut names: Vec<&String> = db
        .hooks
        .keys()
        .filter(|n| pattern == "*" || glob_match(&pattern, n))
        .collect();
    names.sort();

    let mut body = String::from("{\"ok\":true,\"hooks\":[");
    for (i, name) in names.iter().enumerate() {
        let hook = &db.hooks[*name];
        if i > 0 {
            body.push(',');
        }
        body.push('{');
        body.push_str(&format!("\"name\":{}", json_string(&hook.name)));
        body.push_str(&format!(",\"key\":{}", json_string(&hook.key)));
        body.push_str(",\"endpoints\":[");
        for (j, e) in hook.endpoints.iter().enumerate() {
            if j > 0 {
                body.push(',');
            }
            body.push_str(&json_string(&e.original));
        }
        body.push(']');
        let command = hook.message.get(3..).unwrap_or_default().join(" ");
        body.push_str(&format!(",\"command\":{}", json_string(&command)));
        body.push('}');
    }
    body.push_str(&format!("],\"elapsed\":\"{}\"}}", elapsed(start)));
    Ok(Reply::json(body))
}
