//! Leader/follower replication over real sockets: resync, tailing,
//! caught-up gating, and detach.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::Value;

use meridian_server::engine::{self, ConnState, Outcome};
use meridian_server::protocol::{tokenize_line, Message, OutputKind};
use meridian_server::server::ServerInner;
use meridian_server::{Server, ServerOptions};

fn options(dir: &std::path::Path, port: u16) -> ServerOptions {
    ServerOptions::parse_from([
        "meridian-server",
        "-d",
        dir.to_str().unwrap(),
        "-p",
        &port.to_string(),
        "--protected-mode",
        "no",
    ])
}

async fn run_json(inner: &Arc<ServerInner>, conn: &mut ConnState, line: &str) -> Value {
    let msg = Message {
        args: tokenize_line(line).unwrap(),
        output: OutputKind::Json,
    };
    match engine::run_command(inner, conn, &msg).await {
        Ok(Outcome::Reply(reply)) => serde_json::from_str(&reply.json).expect("json reply"),
        Ok(_) => panic!("unexpected outcome for: {line}"),
        Err(e) => panic!("command failed: {line}: {e}"),
    }
}

async fn wait_for<F>(mut cond: F, what: &str)
where
    F: FnMut() -> std::pin::Pin<Box<dyn std::future::Future<Output = bool> + Send>>,
{
    for _ in 0..200 {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn follower_resyncs_and_tails_leader() {
    let leader_port = 21000 + (std::process::id() % 5000) as u16;

    let leader_dir = tempfile::tempdir().unwrap();
    let leader = Server::new(options(leader_dir.path(), leader_port)).unwrap();
    let leader_inner = leader.inner();
    tokio::spawn(async move {
        let _ = leader.run().await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut lconn = ConnState::default();
    for i in 0..50 {
        run_json(
            &leader_inner,
            &mut lconn,
            &format!("SET fleet truck{i} FIELD speed {i} POINT {} {}", i % 80, i % 170),
        )
        .await;
    }

    // Start the follower and point it at the leader.
    let follower_dir = tempfile::tempdir().unwrap();
    let mut follower = Server::new(options(follower_dir.path(), leader_port + 1)).unwrap();
    follower.start_background().await;
    let follower_inner = follower.inner();
    let mut fconn = ConnState::default();
    run_json(
        &follower_inner,
        &mut fconn,
        &format!("FOLLOW 127.0.0.1 {leader_port}"),
    )
    .await;

    {
        let inner = follower_inner.clone();
        wait_for(
            move || {
                let inner = inner.clone();
                Box::pin(async move {
                    let db = inner.db.read().await;
                    db.caught_up
                        && db.get_col("fleet").map(|c| c.count()).unwrap_or(0) == 50
                })
            },
            "follower to catch up",
        )
        .await;
    }

    // Reads now succeed on the follower and agree with the leader.
    let from_leader = run_json(&leader_inner, &mut lconn, "GET fleet truck7").await;
    let from_follower = run_json(&follower_inner, &mut fconn, "GET fleet truck7").await;
    assert_eq!(from_leader["object"], from_follower["object"]);

    // Writes are refused while following.
    let msg = Message {
        args: tokenize_line("SET fleet x POINT 0 0").unwrap(),
        output: OutputKind::Json,
    };
    assert!(matches!(
        engine::run_command(&follower_inner, &mut fconn, &msg).await,
        Err(meridian_server::ServerError::NotLeader)
    ));

    // A later write on the leader streams across.
    run_json(&leader_inner, &mut lconn, "SET fleet late POINT 5 5").await;
    {
        let inner = follower_inner.clone();
        wait_for(
            move || {
                let inner = inner.clone();
                Box::pin(async move {
                    let db = inner.db.read().await;
                    db.get_col("fleet")
                        .map(|c| c.get("late").is_some())
                        .unwrap_or(false)
                })
            },
            "replicated write",
        )
        .await;
    }

    // Logs are byte-identical up to the follower's size.
    {
        let ldb = leader_inner.db.read().await;
        let fdb = follower_inner.db.read().await;
        assert_eq!(ldb.aof.size, fdb.aof.size);
        assert_eq!(
            ldb.aof.checksum(0, ldb.aof.size).unwrap(),
            fdb.aof.checksum(0, fdb.aof.size).unwrap()
        );
    }

    // Detach: the follower becomes writable again.
    run_json(&follower_inner, &mut fconn, "FOLLOW no one").await;
    run_json(&follower_inner, &mut fconn, "SET fleet mine POINT 1 1").await;
}
