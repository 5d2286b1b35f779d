//! Tests for the room chat channel.

use anyhow::Result;
use coedit_server::{ServerState, server};
use common::*;
use serde_json::json;

pub mod common;

#[tokio::test]
async fn test_send_fans_out_to_room() -> Result<()> {
    logging();
    let client = TestClient::start(server(ServerState::temporary().await?)).await?;

    let mut alice = client
        .connect_with("room", Some(&token("alice", "Alice")))
        .await?;
    alice.recv_type("document-state").await?;
    let mut bob = client
        .connect_with("room", Some(&token("bob", "Bob")))
        .await?;
    bob.recv_type("document-state").await?;

    alice
        .send(&json!({
            "type": "chat.send",
            "content": "hello room",
            "clientId": "opt-1"
        }))
        .await;

    for socket in [&mut alice, &mut bob] {
        let msg = socket.recv_type("chat.message").await?;
        assert_eq!(msg["message"]["content"], "hello room");
        assert_eq!(msg["message"]["userId"], "alice");
        assert_eq!(msg["message"]["displayName"], "Alice");
        assert_eq!(msg["message"]["clientId"], "opt-1");
        assert!(msg["message"]["id"].is_string());
        assert!(msg["message"]["timestamp"].is_string());
    }
    Ok(())
}

#[tokio::test]
async fn test_history_replayed_on_join() -> Result<()> {
    logging();
    let client = TestClient::start(server(ServerState::temporary().await?)).await?;

    let mut alice = client
        .connect_with("room", Some(&token("alice", "Alice")))
        .await?;
    alice.recv_type("document-state").await?;
    alice
        .send(&json!({ "type": "chat.send", "content": "first" }))
        .await;
    alice.recv_type("chat.message").await?;

    let mut bob = client
        .connect_with("room", Some(&token("bob", "Bob")))
        .await?;
    bob.recv_type("document-state").await?;
    let replay = bob.recv_type("chat.message").await?;
    assert_eq!(replay["message"]["content"], "first");
    Ok(())
}

#[tokio::test]
async fn test_oversized_message_refused() -> Result<()> {
    logging();
    let client = TestClient::start(server(ServerState::temporary().await?)).await?;

    let mut socket = client.connect("room").await?;
    socket.recv_type("document-state").await?;

    socket
        .send(&json!({ "type": "chat.send", "content": "x".repeat(5001) }))
        .await;
    let err = socket.recv_type("error").await?;
    assert_eq!(err["code"], "too_long");
    Ok(())
}

#[tokio::test]
async fn test_reaction_toggle() -> Result<()> {
    logging();
    let client = TestClient::start(server(ServerState::temporary().await?)).await?;

    let mut alice = client
        .connect_with("room", Some(&token("alice", "Alice")))
        .await?;
    alice.recv_type("document-state").await?;
    let mut bob = client
        .connect_with("room", Some(&token("bob", "Bob")))
        .await?;
    bob.recv_type("document-state").await?;

    alice
        .send(&json!({ "type": "chat.send", "content": "react to me" }))
        .await;
    let msg = alice.recv_type("chat.message").await?;
    let message_id = msg["message"]["id"].as_str().unwrap().to_string();

    bob.send(&json!({ "type": "chat.react", "messageId": message_id, "emoji": "👍" }))
        .await;
    for socket in [&mut alice, &mut bob] {
        let reaction = socket.recv_type("chat.reaction").await?;
        assert_eq!(reaction["emoji"], "👍");
        assert_eq!(reaction["userId"], "bob");
        assert_eq!(reaction["added"], true);
    }

    // the same reaction again removes it
    bob.send(&json!({ "type": "chat.react", "messageId": message_id, "emoji": "👍" }))
        .await;
    for socket in [&mut alice, &mut bob] {
        let reaction = socket.recv_type("chat.reaction").await?;
        assert_eq!(reaction["added"], false);
    }
    Ok(())
}

#[tokio::test]
async fn test_unknown_reaction_target() -> Result<()> {
    logging();
    let client = TestClient::start(server(ServerState::temporary().await?)).await?;

    let mut socket = client.connect("room").await?;
    socket.recv_type("document-state").await?;

    socket
        .send(&json!({
            "type": "chat.react",
            "messageId": "00000000-0000-4000-8000-000000000000",
            "emoji": "👍"
        }))
        .await;
    let err = socket.recv_type("error").await?;
    assert_eq!(err["code"], "invalid_op");
    Ok(())
}

#[tokio::test]
async fn test_send_rate_limit() -> Result<()> {
    logging();
    let client = TestClient::start(server(ServerState::temporary().await?)).await?;

    let mut socket = client.connect("room").await?;
    socket.recv_type("document-state").await?;

    for i in 0..10 {
        socket
            .send(&json!({ "type": "chat.send", "content": format!("msg {i}") }))
            .await;
        socket.recv_type("chat.message").await?;
    }
    socket
        .send(&json!({ "type": "chat.send", "content": "one too many" }))
        .await;
    let err = socket.recv_type("error").await?;
    assert_eq!(err["code"], "rate_limited");
    assert!(err["retryAfter"].as_u64().unwrap() >= 1);
    Ok(())
}

#[tokio::test]
async fn test_typing_indicator_fanout() -> Result<()> {
    logging();
    let client = TestClient::start(server(ServerState::temporary().await?)).await?;

    let mut alice = client
        .connect_with("room", Some(&token("alice", "Alice")))
        .await?;
    alice.recv_type("document-state").await?;
    let mut bob = client
        .connect_with("room", Some(&token("bob", "Bob")))
        .await?;
    bob.recv_type("document-state").await?;

    alice.send(&json!({ "type": "chat.typing", "isTyping": true })).await;
    let typing = bob.recv_type("chat.typing").await?;
    assert_eq!(typing["userId"], "alice");
    assert_eq!(typing["isTyping"], true);

    alice.send(&json!({ "type": "chat.typing", "isTyping": false })).await;
    let typing = bob.recv_type("chat.typing").await?;
    assert_eq!(typing["isTyping"], false);
    Ok(())
}
