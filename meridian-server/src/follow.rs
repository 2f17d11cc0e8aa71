//! Replication follower.
//!
//! A follower dials its leader, verifies it is a sane target (different
//! server id, not itself following), finds the longest common log prefix
//! by MD5 block comparison, rewinds to a frame boundary, then tails the
//! leader's log from that position. The `followc` counter is checked at
//! every step so a FOLLOW change aborts stale loops.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::aof::frame_boundary_at_or_before;
use crate::client::LeaderConn;
use crate::commands::elapsed;
use crate::config::Config;
use crate::engine;
use crate::error::{Result, ServerError};
use crate::protocol::{Message, Reply};
use crate::server::ServerInner;

/// MD5 comparison block size.
const CHECKSUM_SZ: u64 = 512 * 1024;

const DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// `FOLLOW host port` / `FOLLOW no one`
pub async fn cmd_follow(
    inner: &Arc<ServerInner>,
    msg: &Message,
    start: Instant,
) -> Result<Reply> {
    let mut args = crate::args::Args::new(&msg.args);
    let host = args.next()?.to_ascii_lowercase();
    let port_tok = args.next()?.to_ascii_lowercase();
    args.expect_end()?;

    if host == "no" && port_tok == "one" {
        let mut db = inner.db.write().await;
        let update = db.config.following();
        db.config.follow_host = None;
        db.config.follow_port = None;
        let dir = db.dir.clone();
        persist_config(&mut db.config, &dir)?;
        if update {
            db.followc += 1;
            db.caught_up = true;
            tracing::info!("following no one");
        }
        return Ok(Reply::ok(&elapsed(start)));
    }

    let port: u16 = port_tok
        .parse()
        .map_err(|_| ServerError::invalid_argument(&port_tok))?;
    let addr = format!("{host}:{port}");

    let update = {
        let db = inner.db.read().await;
        db.config.follow_host.as_deref() != Some(host.as_str())
            || db.config.follow_port != Some(port)
    };
    if update {
        // Preflight outside the lock: reachable, not ourselves, not a
        // follower itself.
        let my_id = {
            let db = inner.db.read().await;
            db.config.server_id.clone()
        };
        let stats = fetch_server_stats(&addr).await.map_err(|e| {
            ServerError::other(format!("cannot follow: {e}"))
        })?;
        if stats.id == my_id {
            return Err(ServerError::other("cannot follow self"));
        }
        if stats.following.is_some() {
            return Err(ServerError::other("cannot follow a follower"));
        }
    }

    let mut db = inner.db.write().await;
    db.config.follow_host = Some(host.clone());
    db.config.follow_port = Some(port);
    let dir = db.dir.clone();
    persist_config(&mut db.config, &dir)?;
    if update {
        db.followc += 1;
        db.caught_up = false;
        let followc = db.followc;
        tracing::info!(leader = %addr, "following new leader");
        let inner = inner.clone();
        tokio::spawn(async move {
            follow_loop(inner, addr, followc).await;
        });
    }
    Ok(Reply::ok(&elapsed(start)))
}

fn persist_config(config: &mut Config, dir: &std::path::Path) -> Result<()> {
    config.write(dir)
}

struct LeaderStats {
    id: String,
    following: Option<String>,
    aof_size: u64,
}

async fn fetch_server_stats(addr: &str) -> Result<LeaderStats> {
    let mut conn = LeaderConn::connect(addr, DIAL_TIMEOUT).await?;
    let value = conn.request(&["server".to_string()]).await?;
    let stats = &value["stats"];
    Ok(LeaderStats {
        id: stats["id"].as_str().unwrap_or_default().to_string(),
        following: stats["following"].as_str().map(|s| s.to_string()),
        aof_size: stats["aof_size"].as_u64().unwrap_or(0),
    })
}

/// The follower task: resync and tail until the follow target changes.
pub async fn follow_loop(inner: Arc<ServerInner>, addr: String, followc: u64) {
    loop {
        match follow_step(&inner, &addr, followc).await {
            Err(e) if e.to_string() == "no longer following" => return,
            Err(e) => tracing::debug!(leader = %addr, error = %e, "follow"),
            Ok(()) => {}
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

async fn follow_step(inner: &Arc<ServerInner>, addr: &str, followc: u64) -> Result<()> {
    {
        let mut db = inner.db.write().await;
        if db.followc != followc {
            return Err(ServerError::other("no longer following"));
        }
        db.caught_up = false;
    }

    let my_id = {
        let db = inner.db.read().await;
        db.config.server_id.clone()
    };
    let stats = fetch_server_stats(addr).await?;
    if stats.id == my_id {
        return Err(ServerError::other("cannot follow self"));
    }
    if stats.following.is_some() {
        return Err(ServerError::other("cannot follow a follower"));
    }
    {
        let mut db = inner.db.write().await;
        if db.config.follow_id.as_deref() != Some(stats.id.as_str()) {
            db.config.follow_id = Some(stats.id.clone());
            let dir = db.dir.clone();
            let _ = db.config.write(&dir);
        }
    }

    let pos = follow_check_some(inner, addr, followc).await?;
    {
        let mut db = inner.db.write().await;
        db.config.follow_pos = Some(pos);
        let dir = db.dir.clone();
        let _ = db.config.write(&dir);
    }

    let mut conn = LeaderConn::connect(addr, DIAL_TIMEOUT).await?;
    conn.request_live(&["aof".to_string(), pos.to_string()])
        .await?;
    tracing::debug!(leader = %addr, pos, "reading log stream");

    let mut caught_up = pos >= stats.aof_size;
    if caught_up {
        let mut db = inner.db.write().await;
        if db.followc != followc {
            return Err(ServerError::other("no longer following"));
        }
        db.caught_up = true;
        tracing::info!("caught up");
    }
    loop {
        let frame = conn.next_frame().await?;
        let aofsz = engine::apply_replicated(inner, frame, followc).await?;
        if !caught_up && aofsz >= stats.aof_size {
            caught_up = true;
            let mut db = inner.db.write().await;
            db.caught_up = true;
            tracing::info!("caught up");
        }
    }
}

/// Find the resync position: binary search over MD5 blocks for the last
/// common prefix, then rewind to a frame boundary and rebuild local
/// state from the truncated log.
async fn follow_check_some(inner: &Arc<ServerInner>, addr: &str, followc: u64) -> Result<u64> {
    let mut db = inner.db.write().await;
    if db.followc != followc {
        return Err(ServerError::other("no longer following"));
    }
    if db.aof.size < CHECKSUM_SZ {
        // Too little local data to compare reliably; start over.
        if db.aof.size > 0 {
            tracing::warn!("local log too small to resync, restarting from scratch");
            engine::reset_in_memory(&mut db);
            db.aof.truncate_to(0)?;
        }
        return Ok(0);
    }

    let mut conn = LeaderConn::connect(addr, DIAL_TIMEOUT).await?;

    let mut min: u64 = 0;
    let mut limit: u64 = db.aof.size;
    let mut max: u64 = db.aof.size - CHECKSUM_SZ;
    let mut pos: u64 = 0;

    if match_checksums(&db, &mut conn, 0).await? {
        min = CHECKSUM_SZ;
        loop {
            if max < min || max + CHECKSUM_SZ > limit {
                pos = min;
                break;
            }
            if match_checksums(&db, &mut conn, max).await? {
                min = max + CHECKSUM_SZ;
            } else {
                limit = max;
            }
            max = min + ((limit - min) / 2).saturating_sub(CHECKSUM_SZ / 2);
        }
    }

    let fullpos = pos;
    if pos == 0 {
        tracing::warn!("no common log prefix with leader, resetting");
        engine::reset_in_memory(&mut db);
        db.aof.truncate_to(0)?;
        return Ok(0);
    }

    // The matched prefix may end mid-frame; rewind to the nearest
    // boundary.
    let boundary = frame_boundary_at_or_before(db.aof.path(), pos)?;
    if boundary == fullpos {
        tracing::debug!("local log fully intact");
        return Ok(boundary);
    }
    tracing::warn!(from = db.aof.size, to = boundary, "truncating log for resync");
    db.aof.truncate_to(boundary)?;
    engine::reset_in_memory(&mut db);
    db.aof.size = 0;
    engine::load_aof(&mut db)?;
    if db.aof.size != boundary {
        return Err(ServerError::other("log size mismatch after resync reload"));
    }
    Ok(boundary)
}

/// Compare one local/remote MD5 block. EOF on either side means "no
/// match" rather than an error.
async fn match_checksums(
    db: &crate::db::Db,
    conn: &mut LeaderConn,
    pos: u64,
) -> Result<bool> {
    let local = match db.aof.checksum(pos, CHECKSUM_SZ) {
        Ok(sum) => sum,
        Err(ServerError::Eof) => return Ok(false),
        Err(e) => return Err(e),
    };
    let reply = conn
        .request(&[
            "aofmd5".to_string(),
            pos.to_string(),
            CHECKSUM_SZ.to_string(),
        ])
        .await;
    let remote = match reply {
        Ok(v) => v["md5"].as_str().unwrap_or_default().to_string(),
        Err(ServerError::Eof) => return Ok(false),
        Err(e) => return Err(e),
    };
    Ok(local == remote && local.len() == 32)
}
