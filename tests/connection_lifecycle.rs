//! Integration tests for the WebSocket connection lifecycle.
//!
//! Tests the complete flow of connecting, joining a room, exchanging events
//! and disconnecting.

mod common;

use common::{TestClient, TestServer, eventually};
use serde_json::json;
use std::time::Duration;

const ROOMS: &str = r#"
[[rooms]]
id = "lobby"
members = ["alice", "bob", "carol"]

[[rooms]]
id = "tiny"
capacity = 1
members = ["alice", "bob"]

[[rooms]]
id = "stage"
kind = "read-only"
members = ["alice", "bob"]

[[rooms]]
id = "closed"
status = "inactive"
members = ["alice"]
"#;

#[tokio::test]
async fn presence_and_messages_flow() {
    let server = TestServer::spawn(ROOMS).await.unwrap();

    let mut alice = TestClient::connect(&server.url("alice", "lobby")).await.unwrap();
    assert!(server.wait_online("lobby", "alice").await);
    let mut bob = TestClient::connect(&server.url("bob", "lobby")).await.unwrap();
    assert!(server.wait_online("lobby", "bob").await);

    let presence = alice.recv_type("presence").await.unwrap();
    assert_eq!(presence["userId"], "bob");
    assert_eq!(presence["payload"]["status"], "online");

    bob.send(json!({ "type": "message", "payload": { "text": "hi" } }))
        .await
        .unwrap();
    let message = alice.recv_type("message").await.unwrap();
    assert_eq!(message["userId"], "bob");
    assert_eq!(message["roomId"], "lobby");
    assert_eq!(message["payload"]["text"], "hi");

    // The sender sees its own message too.
    let echo = bob.recv_type("message").await.unwrap();
    assert_eq!(echo["payload"]["text"], "hi");

    bob.close().await;
    let presence = alice.recv_type("presence").await.unwrap();
    assert_eq!(presence["userId"], "bob");
    assert_eq!(presence["payload"]["status"], "offline");

    let tracker = &server.service().tracker;
    assert!(server.wait_offline("lobby", "bob").await);
    let mut users = Vec::new();
    for _ in 0..50 {
        users = tracker.active_users("lobby").await.unwrap();
        if users.len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(users, vec!["alice".to_string()]);

    alice.close().await;
    server.stop().await;
}

#[tokio::test]
async fn identity_comes_from_the_session() {
    let server = TestServer::spawn(ROOMS).await.unwrap();
    let mut alice = TestClient::connect(&server.url("alice", "lobby")).await.unwrap();
    assert!(server.wait_online("lobby", "alice").await);

    alice
        .send(json!({ "type": "message", "userId": "mallory", "roomId": "elsewhere", "payload": {} }))
        .await
        .unwrap();
    let message = alice.recv_type("message").await.unwrap();
    assert_eq!(message["userId"], "alice");
    assert_eq!(message["roomId"], "lobby");

    alice.close().await;
    server.stop().await;
}

#[tokio::test]
async fn refused_joins_close_with_mapped_codes() {
    let server = TestServer::spawn(ROOMS).await.unwrap();

    let mut outsider = TestClient::connect(&server.url("mallory", "lobby")).await.unwrap();
    assert_eq!(outsider.expect_close().await.unwrap(), Some(4403));

    let mut lost = TestClient::connect(&server.url("alice", "nowhere")).await.unwrap();
    assert_eq!(lost.expect_close().await.unwrap(), Some(4404));

    let mut inactive = TestClient::connect(&server.url("alice", "closed")).await.unwrap();
    assert_eq!(inactive.expect_close().await.unwrap(), Some(4403));

    server.stop().await;
}

#[tokio::test]
async fn full_room_refuses_the_next_user() {
    let server = TestServer::spawn(ROOMS).await.unwrap();

    let alice = TestClient::connect(&server.url("alice", "tiny")).await.unwrap();
    assert!(server.wait_online("tiny", "alice").await);

    let mut bob = TestClient::connect(&server.url("bob", "tiny")).await.unwrap();
    assert_eq!(bob.expect_close().await.unwrap(), Some(4409));

    alice.close().await;
    assert!(server.wait_offline("tiny", "alice").await);
    let tracker = &server.service().tracker;
    let mut freed = false;
    for _ in 0..50 {
        if tracker.active_connections_count("tiny").await.unwrap() == 0 {
            freed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(freed);

    let _bob = TestClient::connect(&server.url("bob", "tiny")).await.unwrap();
    assert!(server.wait_online("tiny", "bob").await);
    server.stop().await;
}

#[tokio::test]
async fn read_only_rooms_need_a_privileged_role() {
    let server = TestServer::spawn(ROOMS).await.unwrap();

    let mut alice = TestClient::connect(&server.url("alice", "stage")).await.unwrap();
    assert!(server.wait_online("stage", "alice").await);
    let mut bob = TestClient::connect(&server.url_with_role("bob", "stage", "Administrator"))
        .await
        .unwrap();
    assert!(server.wait_online("stage", "bob").await);

    alice
        .send(json!({ "type": "message", "payload": { "text": "let me talk" } }))
        .await
        .unwrap();
    let error = alice.recv_type("system").await.unwrap();
    assert_eq!(error["payload"]["error"], "forbidden");

    bob.send(json!({ "type": "message", "payload": { "text": "welcome" } }))
        .await
        .unwrap();
    let message = alice.recv_type("message").await.unwrap();
    assert_eq!(message["payload"]["text"], "welcome");

    alice.close().await;
    bob.close().await;
    server.stop().await;
}

#[tokio::test]
async fn bad_frames_get_an_error_reply() {
    let server = TestServer::spawn(ROOMS).await.unwrap();
    let mut alice = TestClient::connect(&server.url("alice", "lobby")).await.unwrap();
    assert!(server.wait_online("lobby", "alice").await);

    alice.send_raw("not json").await.unwrap();
    let error = alice.recv_type("system").await.unwrap();
    assert_eq!(error["payload"]["error"], "invalid_frame");

    alice
        .send(json!({ "type": "presence", "payload": { "status": "offline" } }))
        .await
        .unwrap();
    let error = alice.recv_type("system").await.unwrap();
    assert_eq!(error["payload"]["error"], "reserved_type");
    assert!(server.service().hub.is_user_online("lobby", "alice"));

    alice.close().await;
    server.stop().await;
}

#[tokio::test]
async fn handshake_without_session_is_refused() {
    let server = TestServer::spawn(ROOMS).await.unwrap();
    let url = server.url("alice", "lobby");
    let bare = url.split('?').next().unwrap().to_string();
    assert!(TestClient::connect(&bare).await.is_err());
    server.stop().await;
}

#[tokio::test]
async fn admission_refuses_connections_over_capacity() {
    let server = TestServer::spawn(&format!("{ROOMS}\n[connection]\nmax_connections = 1\n"))
        .await
        .unwrap();

    let first = TestClient::connect(&server.url("alice", "lobby")).await.unwrap();
    assert!(server.wait_online("lobby", "alice").await);
    assert!(TestClient::connect(&server.url("bob", "lobby")).await.is_err());
    assert_eq!(server.service().admission.active_connections(), 1);

    first.close().await;
    let admission = &server.service().admission;
    assert!(eventually(Duration::from_secs(5), || admission.active_connections() == 0).await);

    let _bob = TestClient::connect(&server.url("bob", "lobby")).await.unwrap();
    assert!(server.wait_online("lobby", "bob").await);
    server.stop().await;
}

#[tokio::test]
async fn reconnect_replaces_the_previous_connection() {
    let server = TestServer::spawn(ROOMS).await.unwrap();

    let mut first = TestClient::connect(&server.url("alice", "lobby")).await.unwrap();
    assert!(server.wait_online("lobby", "alice").await);
    let _second = TestClient::connect(&server.url("alice", "lobby")).await.unwrap();

    assert_eq!(first.expect_close().await.unwrap(), Some(1001));
    assert!(server.wait_online("lobby", "alice").await);
    assert_eq!(server.service().hub.connection_count(), 1);
    assert!(
        server
            .service()
            .tracker
            .has_active_connection("lobby", "alice")
            .await
            .unwrap()
    );
    server.stop().await;
}

#[tokio::test]
async fn shutdown_closes_clients() {
    let server = TestServer::spawn(ROOMS).await.unwrap();
    let mut alice = TestClient::connect(&server.url("alice", "lobby")).await.unwrap();
    assert!(server.wait_online("lobby", "alice").await);

    server.stop().await;
    assert_eq!(alice.expect_close().await.unwrap(), Some(1001));
}

#[tokio::test]
async fn shutdown_waits_for_connections_to_untrack() {
    let server = TestServer::spawn(ROOMS).await.unwrap();
    let _alice = TestClient::connect(&server.url("alice", "lobby")).await.unwrap();
    let _bob = TestClient::connect(&server.url("bob", "lobby")).await.unwrap();
    assert!(server.wait_online("lobby", "alice").await);
    assert!(server.wait_online("lobby", "bob").await);

    let service = server.stop().await;
    assert_eq!(service.tracker.active_connections_count("lobby").await.unwrap(), 0);
    assert_eq!(service.admission.active_connections(), 0);
}
