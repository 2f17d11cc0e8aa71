//! End-to-end tests driving parsed commands through the full pipeline:
//! parsing, locking, mutation, log append, replay, shrink, and fence
//! delivery — everything but the TCP socket.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::Value;

use meridian_server::engine::{self, ConnState, LiveRequest, Outcome};
use meridian_server::protocol::{tokenize_line, Message, OutputKind};
use meridian_server::server::ServerInner;
use meridian_server::{Server, ServerOptions};

fn options(dir: &std::path::Path) -> ServerOptions {
    ServerOptions::parse_from([
        "meridian-server",
        "-d",
        dir.to_str().unwrap(),
        "--protected-mode",
        "no",
    ])
}

fn new_server(dir: &std::path::Path) -> Server {
    Server::new(options(dir)).expect("server init")
}

async fn run(inner: &Arc<ServerInner>, conn: &mut ConnState, line: &str) -> Result<Outcome, meridian_server::ServerError> {
    let args = tokenize_line(line).unwrap();
    let msg = Message {
        args,
        output: OutputKind::Json,
    };
    engine::run_command(inner, conn, &msg).await
}

/// Run a command and parse its JSON reply.
async fn run_json(inner: &Arc<ServerInner>, conn: &mut ConnState, line: &str) -> Value {
    match run(inner, conn, line).await {
        Ok(Outcome::Reply(reply)) => {
            serde_json::from_str(&reply.json).expect("json reply")
        }
        Ok(_) => panic!("unexpected non-reply outcome for: {line}"),
        Err(e) => panic!("command failed: {line}: {e}"),
    }
}

async fn run_err(inner: &Arc<ServerInner>, conn: &mut ConnState, line: &str) -> meridian_server::ServerError {
    match run(inner, conn, line).await {
        Err(e) => e,
        Ok(_) => panic!("expected error for: {line}"),
    }
}

#[tokio::test]
async fn set_get_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let server = new_server(dir.path());
    let inner = server.inner();
    let mut conn = ConnState::default();

    let v = run_json(&inner, &mut conn, "SET fleet truck1 POINT 33.5 -112.1").await;
    assert_eq!(v["ok"], true);

    let v = run_json(&inner, &mut conn, "GET fleet truck1 POINT").await;
    assert_eq!(v["point"]["lat"], 33.5);
    assert_eq!(v["point"]["lon"], -112.1);

    let v = run_json(&inner, &mut conn, "GET fleet truck1").await;
    assert_eq!(v["object"]["type"], "Point");
    assert_eq!(v["object"]["coordinates"][0], -112.1);

    assert!(matches!(
        run_err(&inner, &mut conn, "GET fleet nosuch").await,
        meridian_server::ServerError::IdNotFound
    ));
    assert!(matches!(
        run_err(&inner, &mut conn, "GET nosuch x").await,
        meridian_server::ServerError::KeyNotFound
    ));
}

#[tokio::test]
async fn del_restores_prior_state() {
    let dir = tempfile::tempdir().unwrap();
    let server = new_server(dir.path());
    let inner = server.inner();
    let mut conn = ConnState::default();

    run_json(&inner, &mut conn, "SET fleet a POINT 1 1").await;
    let before = run_json(&inner, &mut conn, "SERVER").await;

    run_json(&inner, &mut conn, "SET fleet b POINT 2 2").await;
    run_json(&inner, &mut conn, "DEL fleet b").await;

    let after = run_json(&inner, &mut conn, "SERVER").await;
    assert_eq!(before["stats"]["num_objects"], after["stats"]["num_objects"]);
    assert_eq!(before["stats"]["num_points"], after["stats"]["num_points"]);
}

#[tokio::test]
async fn field_where_filters() {
    let dir = tempfile::tempdir().unwrap();
    let server = new_server(dir.path());
    let inner = server.inner();
    let mut conn = ConnState::default();

    run_json(&inner, &mut conn, "SET v car1 FIELD speed 35 POINT 0 0").await;
    run_json(&inner, &mut conn, "SET v car2 FIELD speed 70 POINT 0 0").await;

    let v = run_json(&inner, &mut conn, "SCAN v WHERE speed 50 +inf COUNT").await;
    assert_eq!(v["count"], 1);

    // FSET preserves the other fields and reports the change.
    run_json(&inner, &mut conn, "FSET v car1 speed 55").await;
    let v = run_json(&inner, &mut conn, "SCAN v WHERE speed 50 +inf COUNT").await;
    assert_eq!(v["count"], 2);

    let v = run_json(&inner, &mut conn, "GET v car1 WITHFIELDS").await;
    assert_eq!(v["fields"]["speed"], 55.0);
}

#[tokio::test]
async fn nearby_search_matches_haversine() {
    let dir = tempfile::tempdir().unwrap();
    let server = new_server(dir.path());
    let inner = server.inner();
    let mut conn = ConnState::default();

    run_json(&inner, &mut conn, "SET fleet close POINT 33.462 -112.268").await;
    run_json(&inner, &mut conn, "SET fleet far POINT 33.7 -112.268").await;

    let v = run_json(&inner, &mut conn, "NEARBY fleet POINT 33.462 -112.268 6000").await;
    assert_eq!(v["count"], 1);
    assert_eq!(v["objects"][0]["id"], "close");

    let v = run_json(&inner, &mut conn, "NEARBY fleet POINT 33.462 -112.268 60000 IDS").await;
    assert_eq!(v["count"], 2);
}

#[tokio::test]
async fn within_and_intersects_areas() {
    let dir = tempfile::tempdir().unwrap();
    let server = new_server(dir.path());
    let inner = server.inner();
    let mut conn = ConnState::default();

    run_json(&inner, &mut conn, "SET z inside POINT 5 5").await;
    run_json(&inner, &mut conn, "SET z outside POINT 20 20").await;
    run_json(
        &inner,
        &mut conn,
        r#"SET z line OBJECT {"type":"LineString","coordinates":[[-5,5],[5,5]]}"#,
    )
    .await;

    let v = run_json(&inner, &mut conn, "WITHIN z IDS BOUNDS 0 0 10 10").await;
    assert_eq!(v["count"], 1);
    assert_eq!(v["ids"][0], "inside");

    let v = run_json(&inner, &mut conn, "INTERSECTS z IDS BOUNDS 0 0 10 10").await;
    assert_eq!(v["count"], 2);

    let v = run_json(&inner, &mut conn, "NEARBY z IDS POINT 20 20 10").await;
    assert_eq!(v["count"], 1);
    assert_eq!(v["ids"][0], "outside");
}

#[tokio::test]
async fn ttl_expiry_removes_items() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = new_server(dir.path());
    server.start_background().await;
    let inner = server.inner();
    let mut conn = ConnState::default();

    run_json(&inner, &mut conn, "SET tmp x EX 0.1 POINT 0 0").await;
    let v = run_json(&inner, &mut conn, "TTL tmp x").await;
    assert!(v["ttl"].as_i64().unwrap() >= 0);

    tokio::time::sleep(Duration::from_millis(600)).await;

    assert!(matches!(
        run_err(&inner, &mut conn, "GET tmp x").await,
        meridian_server::ServerError::KeyNotFound | meridian_server::ServerError::IdNotFound
    ));
    let v = run_json(&inner, &mut conn, "TTL tmp x").await;
    assert_eq!(v["ttl"], -2);
}

#[tokio::test]
async fn persist_clears_ttl() {
    let dir = tempfile::tempdir().unwrap();
    let server = new_server(dir.path());
    let inner = server.inner();
    let mut conn = ConnState::default();

    run_json(&inner, &mut conn, "SET k a EX 100 POINT 0 0").await;
    let v = run_json(&inner, &mut conn, "TTL k a").await;
    assert!(v["ttl"].as_i64().unwrap() > 0);
    run_json(&inner, &mut conn, "PERSIST k a").await;
    let v = run_json(&inner, &mut conn, "TTL k a").await;
    assert_eq!(v["ttl"], -1);
    // A later SET without EX keeps it cleared.
    run_json(&inner, &mut conn, "SET k a EX 100 POINT 0 0").await;
    run_json(&inner, &mut conn, "SET k a POINT 0 0").await;
    let v = run_json(&inner, &mut conn, "TTL k a").await;
    assert_eq!(v["ttl"], -1);
}

#[tokio::test]
async fn replay_reproduces_state() {
    let dir = tempfile::tempdir().unwrap();
    let object_bytes;
    let stats_before: Value;
    {
        let server = new_server(dir.path());
        let inner = server.inner();
        let mut conn = ConnState::default();
        for i in 0..200 {
            run_json(
                &inner,
                &mut conn,
                &format!("SET fleet truck{i} FIELD speed {} POINT {} {}", i % 90, i % 80, i % 170),
            )
            .await;
        }
        run_json(&inner, &mut conn, "DEL fleet truck7").await;
        object_bytes = run_json(&inner, &mut conn, "GET fleet truck42").await["object"].to_string();
        stats_before = run_json(&inner, &mut conn, "SERVER").await["stats"].clone();
    }

    // Restart: replay the log from disk.
    let server = new_server(dir.path());
    let inner = server.inner();
    let mut conn = ConnState::default();
    let stats_after = run_json(&inner, &mut conn, "SERVER").await["stats"].clone();
    assert_eq!(stats_before["num_objects"], stats_after["num_objects"]);
    assert_eq!(stats_before["num_points"], stats_after["num_points"]);
    assert_eq!(stats_before["aof_size"], stats_after["aof_size"]);

    let replayed = run_json(&inner, &mut conn, "GET fleet truck42").await["object"].to_string();
    assert_eq!(object_bytes, replayed);
    assert!(matches!(
        run_err(&inner, &mut conn, "GET fleet truck7").await,
        meridian_server::ServerError::IdNotFound
    ));
}

#[tokio::test]
async fn shrink_produces_equivalent_log() {
    let dir = tempfile::tempdir().unwrap();
    let mut snapshots: Vec<(String, String)> = Vec::new();
    {
        let server = new_server(dir.path());
        let inner = server.inner();
        let mut conn = ConnState::default();
        for i in 0..50 {
            run_json(
                &inner,
                &mut conn,
                &format!("SET w id{i} FIELD speed {} POINT {} {}", 10 + i, i % 60, i % 150),
            )
            .await;
        }
        // Rewrites and deletions the shrink must fold away.
        for i in 0..20 {
            run_json(&inner, &mut conn, &format!("SET w id{i} POINT 1 {i}")).await;
        }
        for i in 40..50 {
            run_json(&inner, &mut conn, &format!("DEL w id{i}")).await;
        }
        run_json(&inner, &mut conn, "SETHOOK h1 queue://localhost:7/q NEARBY w FENCE POINT 0 0 1000").await;

        let before = run_json(&inner, &mut conn, "SERVER").await["stats"]["aof_size"]
            .as_u64()
            .unwrap();
        meridian_server::shrink::aofshrink(inner.clone()).await;
        let after = run_json(&inner, &mut conn, "SERVER").await["stats"]["aof_size"]
            .as_u64()
            .unwrap();
        assert!(after < before, "shrink shrank nothing: {before} -> {after}");

        for i in 0..40 {
            let v = run_json(&inner, &mut conn, &format!("GET w id{i} WITHFIELDS")).await;
            snapshots.push((format!("id{i}"), v["object"].to_string()));
        }
    }

    // Replay of the rewritten log yields the same observable state.
    let server = new_server(dir.path());
    let inner = server.inner();
    let mut conn = ConnState::default();
    let v = run_json(&inner, &mut conn, "SERVER").await;
    assert_eq!(v["stats"]["num_objects"], 40);
    for (id, object) in snapshots {
        let v = run_json(&inner, &mut conn, &format!("GET w {id}")).await;
        assert_eq!(v["object"].to_string(), object, "mismatch for {id}");
    }
    let v = run_json(&inner, &mut conn, "HOOKS *").await;
    assert_eq!(v["hooks"][0]["name"], "h1");
}

#[tokio::test]
async fn fence_stream_emits_enter_exit_arc() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = new_server(dir.path());
    server.start_background().await;
    let inner = server.inner();
    let mut conn = ConnState::default();

    // Subscribe the way a live connection does.
    let spec = match run(&inner, &mut conn, "NEARBY fleet FENCE POINT 33 -115 5000").await {
        Ok(Outcome::Live(LiveRequest::Fence(spec))) => spec,
        other => panic!("expected live outcome, got {:?}", other.is_ok()),
    };
    let (_id, mut rx) = inner.lives.register(spec);

    run_json(&inner, &mut conn, "SET fleet t1 POINT 33 -115").await;
    let enter: Value = next_event(&mut rx).await;
    assert_eq!(enter["detect"], "enter");
    let inside: Value = next_event(&mut rx).await;
    assert_eq!(inside["detect"], "inside");
    assert_eq!(enter["group"], inside["group"]);

    run_json(&inner, &mut conn, "SET fleet t1 POINT 34 -115").await;
    let exit: Value = next_event(&mut rx).await;
    assert_eq!(exit["detect"], "exit");
    let outside: Value = next_event(&mut rx).await;
    assert_eq!(outside["detect"], "outside");

    run_json(&inner, &mut conn, "DEL fleet t1").await;
    let del: Value = next_event(&mut rx).await;
    assert_eq!(del["command"], "del");
}

async fn next_event(rx: &mut tokio::sync::mpsc::Receiver<String>) -> Value {
    let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event timeout")
        .expect("channel closed");
    serde_json::from_str(&msg).expect("event json")
}

#[tokio::test]
async fn sethook_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let server = new_server(dir.path());
    let inner = server.inner();
    let mut conn = ConnState::default();

    let cmd = "SETHOOK warehouse queue://localhost:7/q NEARBY fleet FENCE POINT 33 -115 5000";
    run_json(&inner, &mut conn, cmd).await;
    let size_after_first = run_json(&inner, &mut conn, "SERVER").await["stats"]["aof_size"]
        .as_u64()
        .unwrap();

    // Identical re-install: registry and log untouched.
    run_json(&inner, &mut conn, cmd).await;
    let size_after_second = run_json(&inner, &mut conn, "SERVER").await["stats"]["aof_size"]
        .as_u64()
        .unwrap();
    assert_eq!(size_after_first, size_after_second);

    let v = run_json(&inner, &mut conn, "HOOKS *").await;
    assert_eq!(v["hooks"].as_array().unwrap().len(), 1);

    // A different query replaces the hook.
    run_json(
        &inner,
        &mut conn,
        "SETHOOK warehouse queue://localhost:7/q NEARBY fleet FENCE POINT 34 -115 9000",
    )
    .await;
    let v = run_json(&inner, &mut conn, "HOOKS *").await;
    assert_eq!(v["hooks"].as_array().unwrap().len(), 1);
    assert!(v["hooks"][0]["command"].as_str().unwrap().contains("9000"));

    run_json(&inner, &mut conn, "DELHOOK warehouse").await;
    let v = run_json(&inner, &mut conn, "HOOKS *").await;
    assert_eq!(v["hooks"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn auth_and_readonly_gating() {
    let dir = tempfile::tempdir().unwrap();
    let server = new_server(dir.path());
    let inner = server.inner();
    let mut conn = ConnState::default();

    run_json(&inner, &mut conn, "READONLY yes").await;
    assert!(matches!(
        run_err(&inner, &mut conn, "SET k a POINT 0 0").await,
        meridian_server::ServerError::ReadOnly
    ));
    run_json(&inner, &mut conn, "READONLY no").await;
    run_json(&inner, &mut conn, "SET k a POINT 0 0").await;

    run_json(&inner, &mut conn, "CONFIG SET requirepass sekret").await;
    let mut fresh = ConnState::default();
    assert!(matches!(
        run_err(&inner, &mut fresh, "SERVER").await,
        meridian_server::ServerError::AuthRequired
    ));
    assert!(matches!(
        run_err(&inner, &mut fresh, "AUTH wrong").await,
        meridian_server::ServerError::InvalidPassword
    ));
    run_json(&inner, &mut fresh, "AUTH sekret").await;
    run_json(&inner, &mut fresh, "SERVER").await;
}

#[tokio::test]
async fn keys_bounds_stats() {
    let dir = tempfile::tempdir().unwrap();
    let server = new_server(dir.path());
    let inner = server.inner();
    let mut conn = ConnState::default();

    run_json(&inner, &mut conn, "SET fleet:east a POINT 10 20").await;
    run_json(&inner, &mut conn, "SET fleet:west b POINT -10 -20").await;
    run_json(&inner, &mut conn, "SET other c POINT 0 0").await;

    let v = run_json(&inner, &mut conn, "KEYS fleet:*").await;
    let keys: Vec<&str> = v["keys"].as_array().unwrap().iter().map(|k| k.as_str().unwrap()).collect();
    assert_eq!(keys, vec!["fleet:east", "fleet:west"]);

    let v = run_json(&inner, &mut conn, "BOUNDS fleet:east").await;
    assert_eq!(v["bounds"]["sw"]["lat"], 10.0);

    let v = run_json(&inner, &mut conn, "STATS fleet:east nosuch").await;
    assert_eq!(v["stats"][0]["num_objects"], 1);
    assert!(v["stats"][1].is_null());

    run_json(&inner, &mut conn, "DROP fleet:west").await;
    let v = run_json(&inner, &mut conn, "KEYS *").await;
    assert_eq!(v["keys"].as_array().unwrap().len(), 2);

    run_json(&inner, &mut conn, "FLUSHDB").await;
    let v = run_json(&inner, &mut conn, "KEYS *").await;
    assert!(v["keys"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn scan_objects_match_get_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let server = new_server(dir.path());
    let inner = server.inner();
    let mut conn = ConnState::default();

    run_json(&inner, &mut conn, "SET fleet a POINT 33.5 -112.1").await;
    run_json(
        &inner,
        &mut conn,
        r#"SET fleet b OBJECT {"type":"Polygon","coordinates":[[[0,0],[4,0],[4,4],[0,4],[0,0]]]}"#,
    )
    .await;

    let scan = run_json(&inner, &mut conn, "SCAN fleet").await;
    for entry in scan["objects"].as_array().unwrap() {
        let id = entry["id"].as_str().unwrap();
        let got = run_json(&inner, &mut conn, &format!("GET fleet {id}")).await;
        assert_eq!(
            entry["object"].to_string(),
            got["object"].to_string(),
            "object bytes differ for {id}"
        );
    }
}

#[tokio::test]
async fn tile_quadkey_hash_areas() {
    let dir = tempfile::tempdir().unwrap();
    let server = new_server(dir.path());
    let inner = server.inner();
    let mut conn = ConnState::default();

    // Quadkey "3" / tile (1,1,1) is the south-east quadrant.
    run_json(&inner, &mut conn, "SET fleet se POINT -45 90").await;
    run_json(&inner, &mut conn, "SET fleet nw POINT 45 -90").await;

    let v = run_json(&inner, &mut conn, "WITHIN fleet IDS QUADKEY 3").await;
    assert_eq!(v["count"], 1);
    assert_eq!(v["ids"][0], "se");

    let v = run_json(&inner, &mut conn, "WITHIN fleet IDS TILE 1 1 1").await;
    assert_eq!(v["ids"][0], "se");

    // A geohash cell around the north-west point.
    let hash = run_json(&inner, &mut conn, "GET fleet nw HASH 4").await["hash"]
        .as_str()
        .unwrap()
        .to_string();
    let v = run_json(&inner, &mut conn, &format!("WITHIN fleet IDS HASH {hash}")).await;
    assert_eq!(v["ids"][0], "nw");

    // GET-derived area: everything within the polygon stored under an id.
    run_json(
        &inner,
        &mut conn,
        r#"SET zones z1 OBJECT {"type":"Polygon","coordinates":[[[85,-50],[95,-50],[95,-40],[85,-40],[85,-50]]]}"#,
    )
    .await;
    let v = run_json(&inner, &mut conn, "WITHIN fleet IDS GET zones z1").await;
    assert_eq!(v["ids"][0], "se");
}

#[tokio::test]
async fn sparse_queries_return_zero_cursor() {
    let dir = tempfile::tempdir().unwrap();
    let server = new_server(dir.path());
    let inner = server.inner();
    let mut conn = ConnState::default();

    for i in 0..30 {
        run_json(
            &inner,
            &mut conn,
            &format!("SET grid p{i} POINT {} {}", (i % 6) as f64, (i / 6) as f64),
        )
        .await;
    }
    let v = run_json(&inner, &mut conn, "WITHIN grid SPARSE 2 IDS BOUNDS -1 -1 6 6").await;
    assert_eq!(v["cursor"], 0);
    let count = v["count"].as_u64().unwrap();
    // At most one item per cell of the 4x4 grid.
    assert!(count > 0 && count <= 16, "got {count}");
}

#[tokio::test]
async fn maxmemory_refuses_set() {
    let dir = tempfile::tempdir().unwrap();
    let server = new_server(dir.path());
    let inner = server.inner();
    let mut conn = ConnState::default();

    run_json(&inner, &mut conn, "CONFIG SET maxmemory 1kb").await;
    let mut refused = false;
    for i in 0..500 {
        match run(&inner, &mut conn, &format!("SET big id{i} POINT 1 1")).await {
            Ok(_) => {}
            Err(meridian_server::ServerError::OutOfMemory) => {
                refused = true;
                break;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(refused, "maxmemory never enforced");

    // Reads and deletes still work.
    run_json(&inner, &mut conn, "DEL big id0").await;
    run_json(&inner, &mut conn, "CONFIG SET maxmemory 0").await;
    run_json(&inner, &mut conn, "SET big extra POINT 1 1").await;
}

#[tokio::test]
async fn legacy_log_format_migrates_on_startup() {
    let dir = tempfile::tempdir().unwrap();
    // A legacy-format log: u32-LE length + command line + u32-LE length
    // + NUL terminator.
    let mut legacy = Vec::new();
    for line in [
        "SET fleet truck1 FIELD speed 35 POINT 33.5 -112.1",
        "SET fleet truck2 POINT 34 -111",
        "DEL fleet truck2",
    ] {
        let body = line.as_bytes();
        legacy.extend_from_slice(&(body.len() as u32).to_le_bytes());
        legacy.extend_from_slice(body);
        legacy.extend_from_slice(&(body.len() as u32).to_le_bytes());
        legacy.push(0);
    }
    std::fs::write(dir.path().join("appendonly.aof"), &legacy).unwrap();

    let server = new_server(dir.path());
    let inner = server.inner();
    let mut conn = ConnState::default();
    let v = run_json(&inner, &mut conn, "GET fleet truck1 WITHFIELDS").await;
    assert_eq!(v["object"]["coordinates"][1], 33.5);
    assert_eq!(v["fields"]["speed"], 35.0);
    assert!(matches!(
        run_err(&inner, &mut conn, "GET fleet truck2").await,
        meridian_server::ServerError::IdNotFound
    ));

    // The rewritten log is canonical and replays again.
    let raw = std::fs::read(dir.path().join("appendonly.aof")).unwrap();
    assert_eq!(raw[0], b'*');
}

#[tokio::test]
async fn resp_dialect_rendering() {
    use meridian_server::protocol::Reply;

    let dir = tempfile::tempdir().unwrap();
    let server = new_server(dir.path());
    let inner = server.inner();
    let mut conn = ConnState {
        output: OutputKind::Resp,
        ..Default::default()
    };

    let render = |reply: &Reply| String::from_utf8(reply.render(OutputKind::Resp)).unwrap();

    match run(&inner, &mut conn, "PING").await.unwrap() {
        Outcome::Reply(reply) => assert_eq!(render(&reply), "+PONG\r\n"),
        _ => panic!("expected reply"),
    }
    match run(&inner, &mut conn, "SET fleet a POINT 1 2").await.unwrap() {
        Outcome::Reply(reply) => assert_eq!(render(&reply), "+OK\r\n"),
        _ => panic!("expected reply"),
    }
    match run(&inner, &mut conn, "TTL fleet a").await.unwrap() {
        Outcome::Reply(reply) => assert_eq!(render(&reply), ":-1\r\n"),
        _ => panic!("expected reply"),
    }
    match run(&inner, &mut conn, "KEYS *").await.unwrap() {
        Outcome::Reply(reply) => {
            let out = render(&reply);
            assert!(out.starts_with("*1\r\n$5\r\nfleet\r\n"), "got {out}");
        }
        _ => panic!("expected reply"),
    }
    match run(&inner, &mut conn, "GET fleet a").await.unwrap() {
        Outcome::Reply(reply) => {
            let out = render(&reply);
            assert!(out.starts_with('$') && out.contains("Point"), "got {out}");
        }
        _ => panic!("expected reply"),
    }
}

#[tokio::test]
async fn fence_where_clause_filters_events() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = new_server(dir.path());
    server.start_background().await;
    let inner = server.inner();
    let mut conn = ConnState::default();

    let spec = match run(
        &inner,
        &mut conn,
        "NEARBY fleet WHERE speed 50 +inf FENCE POINT 33 -115 5000",
    )
    .await
    {
        Ok(Outcome::Live(LiveRequest::Fence(spec))) => spec,
        _ => panic!("expected live outcome"),
    };
    let (_id, mut rx) = inner.lives.register(spec);

    // Too slow: filtered out.
    run_json(&inner, &mut conn, "SET fleet slow FIELD speed 20 POINT 33 -115").await;
    // Fast enough: delivered.
    run_json(&inner, &mut conn, "SET fleet fast FIELD speed 70 POINT 33 -115").await;

    let event = next_event(&mut rx).await;
    assert_eq!(event["id"], "fast");
    assert_eq!(event["detect"], "enter");
}

#[tokio::test]
async fn sync_hook_failure_reverts_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let server = new_server(dir.path());
    let inner = server.inner();
    let mut conn = ConnState::default();

    {
        let mut db = inner.db.write().await;
        db.hook_sync = true;
    }
    // Port 1 refuses connections, so delivery always fails.
    run_json(
        &inner,
        &mut conn,
        "SETHOOK bad http://127.0.0.1:1/hook NEARBY fleet FENCE POINT 33 -115 5000",
    )
    .await;

    assert!(run(&inner, &mut conn, "SET fleet t1 POINT 33 -115").await.is_err());
    // The in-memory mutation was rolled back.
    assert!(matches!(
        run_err(&inner, &mut conn, "GET fleet t1").await,
        meridian_server::ServerError::KeyNotFound | meridian_server::ServerError::IdNotFound
    ));
}

#[tokio::test]
async fn aofmd5_matches_recomputation() {
    let dir = tempfile::tempdir().unwrap();
    let server = new_server(dir.path());
    let inner = server.inner();
    let mut conn = ConnState::default();

    run_json(&inner, &mut conn, "SET fleet a POINT 1 2").await;
    let size = run_json(&inner, &mut conn, "SERVER").await["stats"]["aof_size"]
        .as_u64()
        .unwrap();
    let v = run_json(&inner, &mut conn, &format!("AOFMD5 0 {size}")).await;
    let sum = v["md5"].as_str().unwrap();
    assert_eq!(sum.len(), 32);

    // Stable across calls, and EOF past the end.
    let v2 = run_json(&inner, &mut conn, &format!("AOFMD5 0 {size}")).await;
    assert_eq!(v2["md5"].as_str().unwrap(), sum);
    assert!(matches!(
        run_err(&inner, &mut conn, &format!("AOFMD5 1 {size}")).await,
        meridian_server::ServerError::Eof
    ));
}
