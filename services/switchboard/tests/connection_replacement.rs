//! Soft connection replacement: a second connection for the same user
//! displaces the first with a notice, never a forced close, and the stale
//! socket's cleanup cannot evict its replacement.

mod common;

use common::{
    connect, create_session, read_until_history_complete, recv_json, send_json, spawn_server,
};
use std::time::Duration;

#[tokio::test]
async fn second_connect_displaces_the_first_with_a_notice() {
    let server = spawn_server().await;
    let session = create_session(&server, "Algo 101", &["alice"]).await;

    let mut first = connect(&server, "alice", "student", &session.id).await;
    read_until_history_complete(&mut first).await;
    let mut second = connect(&server, "alice", "student", &session.id).await;
    read_until_history_complete(&mut second).await;

    let notice = recv_json(&mut first).await;
    assert_eq!(notice["type"], "system");
    assert_eq!(notice["context"], "session_ended");
    assert_eq!(notice["content"]["event"], "session_ended");
    assert_eq!(notice["content"]["reason"], "Connection replaced");

    assert!(
        server.state.index.for_user("alice").await.is_some(),
        "alice stays registered through the replacement"
    );
}

#[tokio::test]
async fn stale_disconnect_does_not_evict_the_replacement() {
    let server = spawn_server().await;
    let session = create_session(&server, "Algo 101", &["alice"]).await;

    let mut teach = connect(&server, "teach", "instructor", &session.id).await;
    read_until_history_complete(&mut teach).await;

    let mut first = connect(&server, "alice", "student", &session.id).await;
    read_until_history_complete(&mut first).await;
    let mut second = connect(&server, "alice", "student", &session.id).await;
    read_until_history_complete(&mut second).await;

    // Drain the replacement notice, then let the displaced peer hang up.
    let _ = recv_json(&mut first).await;
    first.close(None).await.expect("close first");

    // Give the server's read loop time to run the stale deregistration.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        server.state.index.for_user("alice").await.is_some(),
        "stale deregistration must not remove the replacement"
    );

    // The replacement still routes.
    send_json(
        &mut second,
        &serde_json::json!({ "type": "instructor_inbox", "content": {"text": "still here"} }),
    )
    .await;
    let frame = recv_json(&mut teach).await;
    assert_eq!(frame["from_user"], "alice");
    assert_eq!(frame["content"]["text"], "still here");
}

#[tokio::test]
async fn replacement_receives_live_traffic_instead_of_the_displaced_socket() {
    let server = spawn_server().await;
    let session = create_session(&server, "Algo 101", &["alice"]).await;

    let mut teach = connect(&server, "teach", "instructor", &session.id).await;
    read_until_history_complete(&mut teach).await;
    let mut first = connect(&server, "alice", "student", &session.id).await;
    read_until_history_complete(&mut first).await;
    let mut second = connect(&server, "alice", "student", &session.id).await;
    read_until_history_complete(&mut second).await;
    let _ = recv_json(&mut first).await; // replacement notice

    send_json(
        &mut teach,
        &serde_json::json!({ "type": "request", "to_user": "alice", "content": {"q": 1} }),
    )
    .await;

    let frame = recv_json(&mut second).await;
    assert_eq!(frame["type"], "request");
    assert_eq!(frame["to_user"], "alice");
    common::assert_silent(&mut first, Duration::from_millis(300)).await;
}
