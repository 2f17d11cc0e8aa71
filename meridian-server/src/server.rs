//! Server assembly: shared state, startup replay, background tasks, and
//! the TCP front end.
//!
//! The front end accepts both request framings (canonical arrays and
//! newline text), replies in the connection's output dialect, and hands
//! FENCE/AOF connections over to their streaming loops.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify, RwLock};

use crate::aof::Aof;
use crate::commands;
use crate::config::{Config, ServerOptions};
use crate::db::{CommandDetails, Db};
use crate::dispatch::{run_dispatcher, LiveRegistry};
use crate::endpoint::EndpointManager;
use crate::engine::{self, ConnState, LiveRequest, Outcome};
use crate::error::{Result, ServerError};
use crate::protocol::{parse_frame, render_error, Message, Reply, RespValue};

/// Shared server state: the database behind its single reader/writer
/// lock plus the cross-task machinery.
pub struct ServerInner {
    pub db: RwLock<Db>,
    /// Signaled on every log append; AOF tail streams wait on it.
    pub new_data: Notify,
    /// Producer side of the mutation queue drained by the dispatcher.
    pub mutations: mpsc::UnboundedSender<CommandDetails>,
    pub lives: LiveRegistry,
    pub endpoints: EndpointManager,
}

pub struct Server {
    opts: ServerOptions,
    inner: Arc<ServerInner>,
    mutation_rx: Option<mpsc::UnboundedReceiver<CommandDetails>>,
}

impl Server {
    /// Initialize from disk: config, legacy log migration, and replay.
    /// No sockets are opened until [`Server::run`].
    pub fn new(opts: ServerOptions) -> Result<Server> {
        std::fs::create_dir_all(&opts.dir)?;
        let mut config = Config::load(&opts.dir)?;
        config.protected_mode = opts.protected_mode.clone();

        let aof = Aof::open(&opts.dir)?;
        let mut db = Db::new(opts.dir.clone(), config, aof);
        db.dev_mode = opts.dev;
        engine::load_aof(&mut db)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ServerInner {
            db: RwLock::new(db),
            new_data: Notify::new(),
            mutations: tx,
            lives: LiveRegistry::default(),
            endpoints: EndpointManager::new(),
        });
        Ok(Server {
            opts,
            inner,
            mutation_rx: Some(rx),
        })
    }

    /// Shared state handle, for embedding and tests.
    pub fn inner(&self) -> Arc<ServerInner> {
        self.inner.clone()
    }

    /// Spawn the background tasks (dispatcher, expirer, follower).
    /// Called by [`Server::run`]; tests drive it directly.
    pub async fn start_background(&mut self) {
        if let Some(rx) = self.mutation_rx.take() {
            tokio::spawn(run_dispatcher(self.inner.clone(), rx));
        }
        tokio::spawn(run_expirer(self.inner.clone()));

        let mut db = self.inner.db.write().await;
        if let (Some(host), Some(port)) = (&db.config.follow_host, db.config.follow_port) {
            let addr = format!("{host}:{port}");
            db.caught_up = false;
            let followc = db.followc;
            tokio::spawn(crate::follow::follow_loop(self.inner.clone(), addr, followc));
        }
    }

    /// Serve until the process is terminated.
    pub async fn run(mut self) -> Result<()> {
        self.start_background().await;
        let addr = format!("{}:{}", self.opts.host, self.opts.port);
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "server started");

        loop {
            let (stream, peer) = listener.accept().await?;
            let inner = self.inner.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_conn(inner, stream, peer).await {
                    tracing::debug!(peer = %peer, error = %e, "connection ended");
                }
            });
        }
    }
}

/// The per-connection loop: parse, dispatch, reply, maybe go live.
async fn handle_conn(
    inner: Arc<ServerInner>,
    stream: TcpStream,
    peer: std::net::SocketAddr,
) -> Result<()> {
    // Protected mode: refuse remote clients when no password is set.
    {
        let db = inner.db.read().await;
        if db.config.protected_mode != "no"
            && db.config.requirepass.is_empty()
            && !peer.ip().is_loopback()
        {
            let mut stream = stream;
            let body = "{\"ok\":false,\"err\":\"protected mode on, no password set, and the connection is not local\"}\r\n";
            let _ = stream.write_all(body.as_bytes()).await;
            return Ok(());
        }
    }

    let (mut rd, mut wr) = stream.into_split();
    let mut conn = ConnState::default();
    let mut buf: Vec<u8> = Vec::new();

    loop {
        let (args, used) = loop {
            match parse_frame(&buf) {
                Ok(Some(hit)) => break hit,
                Ok(None) => {
                    let mut chunk = [0u8; 16 * 1024];
                    let n = rd.read(&mut chunk).await?;
                    if n == 0 {
                        return Ok(()); // clean disconnect
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                Err(_) => {
                    let e = ServerError::other("invalid message");
                    wr.write_all(&render_error(&e, "", "0s", conn.output)).await?;
                    return Ok(());
                }
            }
        };
        buf.drain(..used);
        if args.is_empty() {
            continue;
        }
        let msg = Message {
            args,
            output: conn.output,
        };
        let cmd = msg.command();
        let start = std::time::Instant::now();

        match engine::run_command(&inner, &mut conn, &msg).await {
            Ok(Outcome::Reply(reply)) => {
                wr.write_all(&reply.render(conn.output)).await?;
            }
            Ok(Outcome::Quit(reply)) => {
                wr.write_all(&reply.render(conn.output)).await?;
                return Ok(());
            }
            Ok(Outcome::Live(req)) => {
                let ack = Reply::json("{\"ok\":true,\"live\":true}".to_string())
                    .with_resp(RespValue::Simple("OK".into()));
                wr.write_all(&ack.render(conn.output)).await?;
                return match req {
                    LiveRequest::Fence(spec) => live_fence(inner, rd, wr, buf, spec).await,
                    LiveRequest::Aof(pos) => live_aof(inner, rd, wr, pos).await,
                };
            }
            Err(e) => {
                let elapsed = format!("{:?}", start.elapsed());
                wr.write_all(&render_error(&e, &cmd, &elapsed, conn.output))
                    .await?;
            }
        }
    }
}

/// Streaming loop for a live fence connection: deliver queued events,
/// watch the socket for QUIT.
async fn live_fence(
    inner: Arc<ServerInner>,
    mut rd: OwnedReadHalf,
    mut wr: OwnedWriteHalf,
    mut inbuf: Vec<u8>,
    spec: crate::fence::FenceSpec,
) -> Result<()> {
    let (id, mut rx) = inner.lives.register(spec);
    tracing::debug!(sub = id, "live fence connected");
    let result = async {
        let mut chunk = [0u8; 4096];
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else { return Ok(()) };
                    wr.write_all(msg.as_bytes()).await?;
                    wr.write_all(b"\r\n").await?;
                }
                n = rd.read(&mut chunk) => {
                    let n = n?;
                    if n == 0 {
                        return Ok(());
                    }
                    inbuf.extend_from_slice(&chunk[..n]);
                    while let Ok(Some((args, used))) = parse_frame(&inbuf) {
                        inbuf.drain(..used);
                        let cmd = args.first().map(|s| s.to_ascii_lowercase()).unwrap_or_default();
                        if cmd.is_empty() || cmd == "quit" {
                            return Ok(());
                        }
                        tracing::debug!(command = %cmd, "non-quit command on live connection");
                        return Ok(());
                    }
                }
            }
        }
    }
    .await;
    inner.lives.deregister(id);
    tracing::debug!(sub = id, "live fence disconnected");
    result
}

/// Streaming loop for `AOF <pos>`: raw log bytes from the position
/// onward, blocking on the new-data signal when caught up.
async fn live_aof(
    inner: Arc<ServerInner>,
    mut rd: OwnedReadHalf,
    mut wr: OwnedWriteHalf,
    pos: u64,
) -> Result<()> {
    use tokio::io::AsyncSeekExt;

    let path = {
        let db = inner.db.read().await;
        db.aof.path().to_path_buf()
    };
    let mut file = tokio::fs::File::open(&path).await?;
    file.seek(std::io::SeekFrom::Start(pos)).await?;

    let mut filebuf = vec![0u8; 64 * 1024];
    let mut sockbuf = [0u8; 4096];
    loop {
        let n = file.read(&mut filebuf).await?;
        if n > 0 {
            wr.write_all(&filebuf[..n]).await?;
            continue;
        }
        // Caught up: wait for new appends, a QUIT, or disconnect.
        tokio::select! {
            _ = inner.new_data.notified() => {}
            r = rd.read(&mut sockbuf) => {
                let n = r?;
                if n == 0 {
                    return Ok(());
                }
                if let Ok(Some((args, _))) = parse_frame(&sockbuf[..n]) {
                    let cmd = args.first().map(|s| s.to_ascii_lowercase()).unwrap_or_default();
                    if cmd.is_empty() || cmd == "quit" {
                        return Ok(());
                    }
                    tracing::error!("received a live command that was not QUIT");
                    return Ok(());
                }
            }
        }
    }
}

/// Background eviction of expired items. Runs every 100 ms on leaders,
/// sampling up to 20 random entries; more than 5 purges triggers an
/// immediate re-run. Followers receive DELs from the leader instead.
pub async fn run_expirer(inner: Arc<ServerInner>) {
    use rand::Rng;

    loop {
        let mut purged = 0u32;
        {
            let mut db = inner.db.write().await;
            if !db.config.following() {
                let now = std::time::Instant::now();
                for _ in 0..20 {
                    let len = db.expires.sample_len();
                    if len == 0 {
                        break;
                    }
                    let idx = rand::thread_rng().gen_range(0..len);
                    let Some((key, id, at)) = db.expires.sample_at(idx).cloned() else {
                        continue;
                    };
                    if now < at {
                        continue;
                    }
                    let current = db.expires.sample_is_current(idx);
                    db.expires.remove_sample(idx);
                    if !current || !db.expires.has_expired(&key, &id, now) {
                        continue;
                    }
                    let del = Message::new(vec!["del".to_string(), key, id]);
                    match commands::apply_write(&mut db, &del, std::time::Instant::now()) {
                        Ok(wr) => {
                            engine::append_and_fanout(&inner, &mut db, &del.args, wr.details);
                            purged += 1;
                        }
                        Err(e) if e.tolerated_during_load() => {}
                        Err(e) => tracing::error!(error = %e, "expiry del failed"),
                    }
                }
            }
        }
        if purged <= 5 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
