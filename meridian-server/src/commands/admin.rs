//! Admin commands that mutate configuration or inspect the log.

use std::time::Instant;

use crate::args::Args;
use crate::commands::elapsed;
use crate::db::Db;
use crate::error::{Result, ServerError};
use crate::protocol::{json_string, Message, Reply, RespValue};

/// `CONFIG GET name | CONFIG SET name [value] | CONFIG REWRITE`
///
/// SET changes the in-memory value only; REWRITE persists the document.
pub fn cmd_config(db: &mut Db, msg: &Message, start: Instant) -> Result<Reply> {
    let mut args = Args::new(&msg.args);
    let sub = args.next()?.to_ascii_lowercase();
    match sub.as_str() {
        "get" => {
            let name = args.next()?;
            args.expect_end()?;
            let value = db
                .config
                .get_property(name)
                .ok_or_else(|| ServerError::other(format!("Unsupported CONFIG parameter: {name}")))?;
            let body = format!(
                "{{\"ok\":true,\"value\":{},\"elapsed\":\"{}\"}}",
                json_string(&value),
                elapsed(start)
            );
            Ok(Reply::json(body))
        }
        "set" => {
            let name = args.next()?.to_string();
            let value = args.rest_joined();
            db.config.set_property(&name, value.trim())?;
            Ok(Reply::ok(&elapsed(start)))
        }
        "rewrite" => {
            args.expect_end()?;
            let dir = db.dir.clone();
            db.config.write(&dir)?;
            Ok(Reply::ok(&elapsed(start)))
        }
        other => Err(ServerError::invalid_argument(other)),
    }
}

/// `READONLY yes|no`
pub fn cmd_readonly(db: &mut Db, msg: &Message, start: Instant) -> Result<Reply> {
    let mut args = Args::new(&msg.args);
    let value = args.next()?.to_ascii_lowercase();
    args.expect_end()?;
    let read_only = match value.as_str() {
        "yes" => true,
        "no" => false,
        _ => return Err(ServerError::invalid_argument(value)),
    };
    if db.config.read_only != read_only {
        db.config.read_only = read_only;
        let dir = db.dir.clone();
        db.config.write(&dir)?;
        tracing::info!(read_only, "read-only mode changed");
    }
    Ok(Reply::ok(&elapsed(start)))
}

/// `AOFMD5 pos size`: checksum of a log byte range, for follower resync.
pub fn cmd_aofmd5(db: &Db, msg: &Message, start: Instant) -> Result<Reply> {
    let mut args = Args::new(&msg.args);
    let pos = args.next_u64()?;
    let size = args.next_u64()?;
    args.expect_end()?;
    let md5 = db.aof.checksum(pos, size)?;
    let body = format!(
        "{{\"ok\":true,\"md5\":\"{md5}\",\"elapsed\":\"{}\"}}",
        elapsed(start)
    );
    Ok(Reply::json(body).with_resp(RespValue::Bulk(md5)))
}
