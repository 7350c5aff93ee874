//! Integration tests for live viewer counts.
//!
//! These tests start a real server and connect several clients,
//! verifying heartbeat counting, explicit leave, leave-on-disconnect and
//! time-based expiry driven by the server's manual clock.

mod common;

use common::{connect, start_test_server};
use pathpad_collab::protocol::ServerMessage;
use pathpad_collab::{PRESENCE_TTL, HEARTBEAT_INTERVAL};
use tokio::time::{sleep, Duration, Instant};

async fn active_count(inbox: &mut common::Inbox) -> usize {
    match inbox.reply().await {
        ServerMessage::ActiveViewers { count, .. } => count,
        other => panic!("expected ActiveViewers, got {other:?}"),
    }
}

/// Wait until the server-side count for `path` reaches `expected`.
async fn wait_for_count(server: &common::TestServer, path: &str, expected: usize) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while server.service.active_viewers(path) != expected {
        assert!(Instant::now() < deadline, "count for {path} never reached {expected}");
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_heartbeat_counts_viewers() {
    let server = start_test_server().await;
    let (alice, mut alice_inbox) = connect(&server.url).await;
    let (bob, mut bob_inbox) = connect(&server.url).await;

    alice.heartbeat("notes/a").await.unwrap();
    assert_eq!(active_count(&mut alice_inbox).await, 1);
    bob.heartbeat("notes/a").await.unwrap();
    assert_eq!(active_count(&mut bob_inbox).await, 2);

    // Repeated beats from the same viewer count once
    alice.heartbeat("notes/a").await.unwrap();
    assert_eq!(active_count(&mut alice_inbox).await, 2);
}

#[tokio::test]
async fn test_paths_counted_independently() {
    let server = start_test_server().await;
    let (alice, mut inbox) = connect(&server.url).await;
    alice.heartbeat("a").await.unwrap();
    assert_eq!(active_count(&mut inbox).await, 1);
    alice.heartbeat("b").await.unwrap();
    assert_eq!(active_count(&mut inbox).await, 1);
    assert_eq!(server.service.active_viewers("c"), 0);
}

#[tokio::test]
async fn test_explicit_leave() {
    let server = start_test_server().await;
    let (alice, mut alice_inbox) = connect(&server.url).await;
    let (bob, mut bob_inbox) = connect(&server.url).await;

    alice.heartbeat("room").await.unwrap();
    active_count(&mut alice_inbox).await;
    bob.heartbeat("room").await.unwrap();
    active_count(&mut bob_inbox).await;

    bob.leave("room").await.unwrap();
    assert_eq!(active_count(&mut bob_inbox).await, 1);
}

#[tokio::test]
async fn test_viewer_expires_after_ttl() {
    let server = start_test_server().await;
    let (alice, mut inbox) = connect(&server.url).await;

    alice.heartbeat("p").await.unwrap();
    assert_eq!(active_count(&mut inbox).await, 1);

    server.clock.advance(PRESENCE_TTL - Duration::from_secs(1));
    assert_eq!(server.service.active_viewers("p"), 1);

    server.clock.advance(Duration::from_secs(2));
    assert_eq!(server.service.active_viewers("p"), 0);
}

#[tokio::test]
async fn test_missed_beats_tolerated() {
    let server = start_test_server().await;
    let (alice, mut inbox) = connect(&server.url).await;

    alice.heartbeat("p").await.unwrap();
    active_count(&mut inbox).await;
    server.clock.advance(HEARTBEAT_INTERVAL * 2);
    alice.heartbeat("p").await.unwrap();
    assert_eq!(active_count(&mut inbox).await, 1);
    server.clock.advance(HEARTBEAT_INTERVAL * 2);
    assert_eq!(server.service.active_viewers("p"), 1);
}

#[tokio::test]
async fn test_disconnect_leaves_loaded_path() {
    let server = start_test_server().await;
    let (alice, mut alice_inbox) = connect(&server.url).await;
    let (mut bob, mut bob_inbox) = connect(&server.url).await;

    for (client, inbox) in [(&alice, &mut alice_inbox), (&bob, &mut bob_inbox)] {
        client.load("shared", None, None).await.unwrap();
        inbox.reply().await;
        client.heartbeat("shared").await.unwrap();
        active_count(inbox).await;
    }
    assert_eq!(server.service.active_viewers("shared"), 2);

    bob.disconnect().await;
    wait_for_count(&server, "shared", 1).await;
}

#[tokio::test]
async fn test_heartbeat_loop_keeps_viewer_active() {
    let server = start_test_server().await;
    let (mut alice, _inbox) = connect(&server.url).await;

    alice
        .start_heartbeat_every("looped", Duration::from_millis(50))
        .unwrap();
    wait_for_count(&server, "looped", 1).await;

    // Beats keep arriving after the clock moves past the TTL
    server.clock.advance(PRESENCE_TTL + Duration::from_secs(1));
    wait_for_count(&server, "looped", 1).await;

    alice.stop_heartbeat().await;
    wait_for_count(&server, "looped", 0).await;
}
