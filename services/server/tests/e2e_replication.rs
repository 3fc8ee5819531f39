//! End-to-end master/replica tests.
//!
//! Both servers run in-process on ephemeral ports; the replica dials the
//! master over real TCP, performs the PSYNC handshake, and applies the
//! propagated command stream.
//!
//! # Coverage
//! - INFO replication fields on both roles
//! - Write propagation: a SET on the master becomes visible on the replica
//! - Propagation order across several writes
//! - WAIT: immediate replies and the ack barrier with a live replica

use kv_test_utils::RespClient;
use kv_wire::Frame;
use server::{ReplicaOf, Server, ServerConfig};
use std::net::SocketAddr;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

async fn start_server(config: ServerConfig) -> SocketAddr {
    let server = Server::bind(config).await.expect("failed to bind server");
    let port = server.local_addr().port();
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    SocketAddr::from(([127, 0, 0, 1], port))
}

async fn start_master() -> SocketAddr {
    start_server(ServerConfig {
        port: 0,
        ..ServerConfig::default()
    })
    .await
}

async fn start_replica(master: SocketAddr) -> SocketAddr {
    let addr = start_server(ServerConfig {
        port: 0,
        replicaof: Some(ReplicaOf {
            host: "127.0.0.1".to_owned(),
            port: master.port(),
        }),
        ..ServerConfig::default()
    })
    .await;
    // Give the handshake a moment to complete before tests write.
    tokio::time::sleep(Duration::from_millis(150)).await;
    addr
}

async fn client(addr: SocketAddr) -> RespClient {
    RespClient::connect(addr).await.expect("failed to connect")
}

/// Poll a GET on `addr` until it returns `expected` or the deadline passes.
async fn wait_for_value(addr: SocketAddr, key: &str, expected: &str) {
    let mut c = client(addr).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let got = c.roundtrip(&["GET", key]).await.unwrap();
        if got == Frame::Bulk(expected.to_owned()) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "replica never saw {key}={expected}, last reply {got:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn info_body(frame: Frame) -> String {
    match frame {
        Frame::Bulk(body) => body,
        other => panic!("expected bulk INFO reply, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn info_reports_roles_and_replication_ids() {
    let master = start_master().await;
    let replica = start_replica(master).await;

    let mut mc = client(master).await;
    let body = info_body(mc.roundtrip(&["INFO", "replication"]).await.unwrap());
    assert!(body.contains("role:master"), "got {body:?}");
    assert!(body.contains("master_repl_offset:0"), "got {body:?}");
    let replid_line = body
        .lines()
        .find(|l| l.starts_with("master_replid:"))
        .expect("replid line");
    assert_eq!(replid_line.len(), "master_replid:".len() + 40);

    let mut rc = client(replica).await;
    let body = info_body(rc.roundtrip(&["INFO", "replication"]).await.unwrap());
    assert!(body.contains("role:slave"), "got {body:?}");
    // After the handshake the replica carries the master's replication id.
    assert!(body.contains(replid_line), "got {body:?}");
}

#[tokio::test]
async fn writes_on_the_master_reach_the_replica() {
    let master = start_master().await;
    let replica = start_replica(master).await;

    let mut mc = client(master).await;
    assert_eq!(
        mc.roundtrip(&["SET", "shared", "value"]).await.unwrap(),
        Frame::Simple("OK".to_owned())
    );
    wait_for_value(replica, "shared", "value").await;
}

#[tokio::test]
async fn propagation_preserves_write_order() {
    let master = start_master().await;
    let replica = start_replica(master).await;

    let mut mc = client(master).await;
    for i in 0..10 {
        mc.roundtrip(&["SET", "seq", &i.to_string()]).await.unwrap();
    }
    mc.roundtrip(&["RPUSH", "log", "a", "b"]).await.unwrap();
    mc.roundtrip(&["INCR", "counter"]).await.unwrap();

    wait_for_value(replica, "seq", "9").await;
    wait_for_value(replica, "counter", "1").await;

    let mut rc = client(replica).await;
    assert_eq!(
        rc.roundtrip(&["LRANGE", "log", "0", "-1"]).await.unwrap(),
        Frame::bulk_array(&["a", "b"])
    );
}

#[tokio::test]
async fn reads_are_not_propagated() {
    let master = start_master().await;
    let replica = start_replica(master).await;

    let mut mc = client(master).await;
    mc.roundtrip(&["SET", "k", "v"]).await.unwrap();
    mc.roundtrip(&["GET", "k"]).await.unwrap();
    mc.roundtrip(&["LRANGE", "nope", "0", "-1"]).await.unwrap();
    wait_for_value(replica, "k", "v").await;

    // Offset advanced by exactly one propagated SET frame.
    let expected = kv_wire::encode_bulk_array(&["SET", "k", "v"]).len();
    let body = info_body(mc.roundtrip(&["INFO", "replication"]).await.unwrap());
    assert!(
        body.contains(&format!("master_repl_offset:{expected}")),
        "got {body:?}"
    );
}

#[tokio::test]
async fn transactional_writes_propagate_to_the_replica() {
    let master = start_master().await;
    let replica = start_replica(master).await;

    let mut mc = client(master).await;
    assert_eq!(
        mc.roundtrip(&["MULTI"]).await.unwrap(),
        Frame::Simple("OK".to_owned())
    );
    assert_eq!(
        mc.roundtrip(&["SET", "txk", "txv"]).await.unwrap(),
        Frame::Simple("QUEUED".to_owned())
    );
    assert_eq!(
        mc.roundtrip(&["RPUSH", "txlog", "a", "b"]).await.unwrap(),
        Frame::Simple("QUEUED".to_owned())
    );
    assert_eq!(
        mc.roundtrip(&["INCR", "txn"]).await.unwrap(),
        Frame::Simple("QUEUED".to_owned())
    );
    assert_eq!(
        mc.roundtrip(&["EXEC"]).await.unwrap(),
        Frame::Array(vec![
            Frame::Simple("OK".to_owned()),
            Frame::Integer(2),
            Frame::Integer(1),
        ])
    );

    wait_for_value(replica, "txk", "txv").await;
    // INCR was queued last, so once its result is visible the RPUSH that
    // preceded it in the queue must have been applied too.
    wait_for_value(replica, "txn", "1").await;
    let mut rc = client(replica).await;
    assert_eq!(
        rc.roundtrip(&["LRANGE", "txlog", "0", "-1"]).await.unwrap(),
        Frame::bulk_array(&["a", "b"])
    );

    // Each queued mutation was propagated as its own frame.
    let expected = kv_wire::encode_bulk_array(&["SET", "txk", "txv"]).len()
        + kv_wire::encode_bulk_array(&["RPUSH", "txlog", "a", "b"]).len()
        + kv_wire::encode_bulk_array(&["INCR", "txn"]).len();
    let body = info_body(mc.roundtrip(&["INFO", "replication"]).await.unwrap());
    assert!(
        body.contains(&format!("master_repl_offset:{expected}")),
        "got {body:?}"
    );
}

#[tokio::test]
async fn wait_returns_zero_for_zero_replicas() {
    let master = start_master().await;
    let mut mc = client(master).await;
    assert_eq!(
        mc.roundtrip(&["WAIT", "0", "100"]).await.unwrap(),
        Frame::Integer(0)
    );
}

#[tokio::test]
async fn wait_before_any_write_counts_replicas() {
    let master = start_master().await;
    let _replica = start_replica(master).await;
    let mut mc = client(master).await;
    assert_eq!(
        mc.roundtrip(&["WAIT", "1", "100"]).await.unwrap(),
        Frame::Integer(1)
    );
}

#[tokio::test]
async fn wait_gathers_acks_from_a_live_replica() {
    let master = start_master().await;
    let replica = start_replica(master).await;

    let mut mc = client(master).await;
    mc.roundtrip(&["SET", "k", "v"]).await.unwrap();
    wait_for_value(replica, "k", "v").await;

    match mc.roundtrip(&["WAIT", "1", "1000"]).await.unwrap() {
        Frame::Integer(acks) => assert!(acks >= 1, "got {acks} acks"),
        other => panic!("expected integer, got {other:?}"),
    }
}

#[tokio::test]
async fn wait_times_out_at_zero_acks_without_replicas_catching_up() {
    let master = start_master().await;
    // No replica at all, but a write moves the master offset past zero.
    let mut mc = client(master).await;
    mc.roundtrip(&["SET", "k", "v"]).await.unwrap();
    let started = tokio::time::Instant::now();
    assert_eq!(
        mc.roundtrip(&["WAIT", "1", "200"]).await.unwrap(),
        Frame::Integer(0)
    );
    assert!(started.elapsed() >= Duration::from_millis(180));
}
