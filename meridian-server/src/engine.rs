//! Command dispatch and locking discipline.
//!
//! Reads take the shared lock and are refused on a follower that has not
//! caught up. Writes take the exclusive lock, are refused on followers
//! and read-only servers, and append to the log before the reply is
//! released. FENCE searches and AOF tailing do not produce a reply at
//! all: they return a [`LiveRequest`] and the transport hands the
//! connection to a streaming loop.

use std::sync::Arc;
use std::time::Instant;

use crate::commands::{self, elapsed};
use crate::db::{CommandDetails, Db};
use crate::error::{Result, ServerError};
use crate::fence::FenceSpec;
use crate::protocol::{Message, OutputKind, Reply, RespValue};
use crate::server::ServerInner;

/// Per-connection engine state.
#[derive(Debug, Default)]
pub struct ConnState {
    pub authenticated: bool,
    pub output: OutputKind,
}

/// What the transport should do after a command.
pub enum Outcome {
    Reply(Reply),
    /// Send the reply, then close the connection.
    Quit(Reply),
    /// Acknowledge with the live sentinel and enter a streaming loop.
    Live(LiveRequest),
}

pub enum LiveRequest {
    Fence(FenceSpec),
    Aof(u64),
}

/// Run one parsed command against the server.
pub async fn run_command(
    inner: &Arc<ServerInner>,
    conn: &mut ConnState,
    msg: &Message,
) -> Result<Outcome> {
    let start = Instant::now();
    let cmd = msg.command();
    if cmd.is_empty() {
        return Err(ServerError::other("empty command"));
    }

    // Authentication gate: only AUTH (and a parting QUIT) may run on an
    // unauthenticated connection.
    if !matches!(cmd.as_str(), "auth" | "quit") {
        let db = inner.db.read().await;
        if !db.config.requirepass.is_empty() && !conn.authenticated {
            return Err(ServerError::AuthRequired);
        }
    }

    match cmd.as_str() {
        "ping" => {
            let body = format!(
                "{{\"ok\":true,\"ping\":\"pong\",\"elapsed\":\"{}\"}}",
                elapsed(start)
            );
            Ok(Outcome::Reply(
                Reply::json(body).with_resp(RespValue::Simple("PONG".into())),
            ))
        }
        "quit" => Ok(Outcome::Quit(Reply::ok(&elapsed(start)))),
        "output" => cmd_output(conn, msg, start),
        "auth" => cmd_auth(inner, conn, msg, start).await,
        "gc" => Ok(Outcome::Reply(Reply::ok(&elapsed(start)))),

        // Writes.
        "set" | "fset" | "del" | "drop" | "flushdb" | "expire" | "persist" | "sethook"
        | "delhook" => {
            let reply = write_command(inner, msg, start).await?;
            Ok(Outcome::Reply(reply))
        }

        // Reads.
        "get" | "keys" | "scan" | "bounds" | "stats" | "server" | "ttl" | "hooks" => {
            let db = inner.db.read().await;
            if db.config.following() && !db.caught_up {
                return Err(ServerError::CatchingUp);
            }
            let reply = match cmd.as_str() {
                "get" => commands::crud::cmd_get(&db, msg, start)?,
                "ttl" => commands::crud::cmd_ttl(&db, msg, start)?,
                "keys" => commands::scan::cmd_keys(&db, msg, start)?,
                "scan" => commands::scan::cmd_scan(&db, msg, start)?,
                "bounds" => commands::scan::cmd_bounds(&db, msg, start)?,
                "stats" => commands::scan::cmd_stats(&db, msg, start)?,
                "server" => commands::scan::cmd_server(&db, msg, start)?,
                "hooks" => commands::hooks::cmd_hooks(&db, msg, start)?,
                _ => unreachable!(),
            };
            Ok(Outcome::Reply(reply))
        }

        // Searches, which may turn into fence subscriptions.
        "nearby" | "within" | "intersects" => {
            let db = inner.db.read().await;
            if db.config.following() && !db.caught_up {
                return Err(ServerError::CatchingUp);
            }
            let outcome = match cmd.as_str() {
                "nearby" => commands::search::cmd_nearby(&db, msg, start)?,
                "within" => commands::search::cmd_within(&db, msg, start)?,
                _ => commands::search::cmd_intersects(&db, msg, start)?,
            };
            Ok(match outcome {
                commands::search::SearchOutcome::Reply(r) => Outcome::Reply(r),
                commands::search::SearchOutcome::Fence(spec) => {
                    Outcome::Live(LiveRequest::Fence(spec))
                }
            })
        }

        // Admin.
        "aofmd5" => {
            let db = inner.db.read().await;
            Ok(Outcome::Reply(commands::admin::cmd_aofmd5(&db, msg, start)?))
        }
        "aof" => {
            let mut args = crate::args::Args::new(&msg.args);
            let pos = args.next_u64()?;
            args.expect_end()?;
            let db = inner.db.read().await;
            if pos > db.aof.size {
                return Err(ServerError::other(
                    "pos is too big, must be less that the aof_size of leader",
                ));
            }
            Ok(Outcome::Live(LiveRequest::Aof(pos)))
        }
        "aofshrink" => {
            let inner = inner.clone();
            tokio::spawn(async move {
                crate::shrink::aofshrink(inner).await;
            });
            Ok(Outcome::Reply(Reply::ok(&elapsed(start))))
        }
        "config" => {
            let mut db = inner.db.write().await;
            Ok(Outcome::Reply(commands::admin::cmd_config(
                &mut db, msg, start,
            )?))
        }
        "readonly" => {
            let mut db = inner.db.write().await;
            Ok(Outcome::Reply(commands::admin::cmd_readonly(
                &mut db, msg, start,
            )?))
        }
        "follow" => {
            let reply = crate::follow::cmd_follow(inner, msg, start).await?;
            Ok(Outcome::Reply(reply))
        }
        "massinsert" => {
            let reply = cmd_massinsert(inner, msg, start).await?;
            Ok(Outcome::Reply(reply))
        }
        other => Err(ServerError::UnknownCommand(other.to_string())),
    }
}

/// The write path: exclusive lock, mode gating, mutation, optional
/// synchronous hook preflight, then log append and fan-out.
pub async fn write_command(
    inner: &Arc<ServerInner>,
    msg: &Message,
    start: Instant,
) -> Result<Reply> {
    let mut db = inner.db.write().await;
    if db.config.following() {
        return Err(ServerError::NotLeader);
    }
    if db.config.read_only {
        return Err(ServerError::ReadOnly);
    }
    if msg.command() == "set" && db.out_of_memory() {
        return Err(ServerError::OutOfMemory);
    }

    let commands::WriteResult {
        reply,
        details,
        undo,
        append,
    } = commands::apply_write(&mut db, msg, start)?;

    // Synchronous hook mode: deliver before the append; a failed
    // delivery reverts the mutation and fails the command.
    if db.hook_sync {
        if let Some(d) = &details {
            let hooks = db.hooks_for_key(&d.key);
            for hook in hooks {
                let msgs = {
                    let mut groups = hook.groups.lock();
                    crate::fence::fence_match(&db, Some(&hook.name), &hook.spec, &mut groups, d)
                };
                for m in &msgs {
                    for ep in &hook.endpoints {
                        if let Err(e) = inner.endpoints.send(ep, m).await {
                            db.apply_undo(undo);
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    if append {
        append_and_fanout(inner, &mut db, &msg.args, details);
    }
    Ok(reply)
}

/// Append to the log and wake the streaming and dispatch machinery. A
/// failed append after a successful in-memory mutation terminates the
/// process: the log is the source of truth on restart.
pub fn append_and_fanout(
    inner: &ServerInner,
    db: &mut Db,
    args: &[String],
    details: Option<CommandDetails>,
) {
    if let Err(e) = db.aof.append_frame(args) {
        tracing::error!(error = %e, "log append failed after mutation, terminating");
        std::process::exit(1);
    }
    inner.new_data.notify_waiters();
    if let Some(d) = details {
        let _ = inner.mutations.send(d);
    }
}

/// Replay the log into a fresh database. `key not found` / `id not
/// found` are tolerated (shrink rewrites produce them); anything else
/// halts startup. A torn trailing frame is truncated away.
pub fn load_aof(db: &mut Db) -> Result<()> {
    let start = Instant::now();
    let file = match std::fs::File::open(db.aof.path()) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let mut rd = crate::aof::FrameReader::new(std::io::BufReader::new(file));
    let mut count = 0u64;
    loop {
        match rd.next() {
            Ok(Some(args)) => {
                let msg = Message::new(args);
                if msg.command() != "killaof" {
                    match commands::apply_write(db, &msg, Instant::now()) {
                        Ok(_) => {}
                        Err(e) if e.tolerated_during_load() => {}
                        Err(e) => return Err(e),
                    }
                }
                db.aof.size = rd.offset();
                count += 1;
            }
            Ok(None) => break,
            Err(ServerError::CorruptedLog) => {
                tracing::warn!(
                    size = rd.offset(),
                    "log is corrupted, likely data loss; truncating"
                );
                db.aof.truncate_to(rd.offset())?;
                break;
            }
            Err(e) => return Err(e),
        }
    }
    let secs = start.elapsed().as_secs_f64();
    tracing::info!(
        commands = count,
        size = db.aof.size,
        elapsed = format!("{secs:.3}s").as_str(),
        "log replay complete"
    );
    Ok(())
}

/// Apply one frame received from the leader. Appends to the local log so
/// leader and follower logs stay byte-identical, even for frames whose
/// targets a shrink rewrite already removed.
pub async fn apply_replicated(
    inner: &Arc<ServerInner>,
    args: Vec<String>,
    followc: u64,
) -> Result<u64> {
    let mut db = inner.db.write().await;
    if db.followc != followc {
        return Err(ServerError::other("no longer following"));
    }
    let msg = Message::new(args);
    if msg.command() == "killaof" {
        return Err(ServerError::other("leader shrank its log"));
    }
    let details = match commands::apply_write(&mut db, &msg, Instant::now()) {
        Ok(wr) => wr.details,
        Err(e) if e.tolerated_during_load() => None,
        Err(e) => return Err(e),
    };
    append_and_fanout(inner, &mut db, &msg.args, details);
    Ok(db.aof.size)
}

/// Clear the in-memory state, keeping configuration. Used by follower
/// resync before replaying the truncated local log.
pub fn reset_in_memory(db: &mut Db) {
    db.collections.clear();
    db.hooks.clear();
    db.hooks_by_key.clear();
    db.expires.clear_all();
}

fn cmd_output(conn: &mut ConnState, msg: &Message, start: Instant) -> Result<Outcome> {
    let mut args = crate::args::Args::new(&msg.args);
    match args.take() {
        None => {
            let name = match conn.output {
                OutputKind::Json => "json",
                OutputKind::Resp => "resp",
            };
            let body = format!(
                "{{\"ok\":true,\"output\":\"{name}\",\"elapsed\":\"{}\"}}",
                elapsed(start)
            );
            Ok(Outcome::Reply(Reply::json(body)))
        }
        Some(tok) => {
            args.expect_end()?;
            match tok.to_ascii_lowercase().as_str() {
                "json" => conn.output = OutputKind::Json,
                "resp" => conn.output = OutputKind::Resp,
                _ => return Err(ServerError::invalid_argument(tok)),
            }
            Ok(Outcome::Reply(Reply::ok(&elapsed(start))))
        }
    }
}

async fn cmd_auth(
    inner: &Arc<ServerInner>,
    conn: &mut ConnState,
    msg: &Message,
    start: Instant,
) -> Result<Outcome> {
    let mut args = crate::args::Args::new(&msg.args);
    let password = args.next()?;
    args.expect_end()?;
    let db = inner.db.read().await;
    if db.config.requirepass.is_empty() {
        return Err(ServerError::other("Client sent AUTH, but no password is set"));
    }
    if db.config.requirepass != password {
        return Err(ServerError::InvalidPassword);
    }
    conn.authenticated = true;
    Ok(Outcome::Reply(Reply::ok(&elapsed(start))))
}

/// `MASSINSERT count`: developer bulk loader. Synthesizes SET commands
/// through the normal write path in batches.
async fn cmd_massinsert(
    inner: &Arc<ServerInner>,
    msg: &Message,
    start: Instant,
) -> Result<Reply> {
    use rand::Rng;

    {
        let db = inner.db.read().await;
        if !db.dev_mode {
            return Err(ServerError::UnknownCommand("massinsert".to_string()));
        }
    }
    let mut args = crate::args::Args::new(&msg.args);
    let count = args.next_u64()?;
    args.expect_end()?;
    if count > 10_000_000 {
        return Err(ServerError::invalid_argument(count.to_string()));
    }

    let mut inserted = 0u64;
    while inserted < count {
        let batch = (count - inserted).min(1000);
        let mut db = inner.db.write().await;
        if db.config.following() {
            return Err(ServerError::NotLeader);
        }
        for _ in 0..batch {
            let (lat, lon) = {
                let mut rng = rand::thread_rng();
                (rng.gen_range(-85.0..85.0), rng.gen_range(-180.0..180.0))
            };
            let set_args: Vec<String> = vec![
                "set".into(),
                format!("mi:{}", inserted % 16),
                inserted.to_string(),
                "point".into(),
                format!("{lat}"),
                format!("{lon}"),
            ];
            let set_msg = Message::new(set_args);
            let wr = commands::apply_write(&mut db, &set_msg, Instant::now())?;
            append_and_fanout(inner, &mut db, &set_msg.args, wr.details);
            inserted += 1;
        }
        drop(db);
        tokio::task::yield_now().await;
    }
    tracing::info!(count, "massinsert complete");
    Ok(Reply::ok(&elapsed(start)))
}
