//! Tests for UTF-16 position semantics.

use anyhow::Result;
use coedit_server::{ServerState, server};
use common::*;
use serde_json::json;

pub mod common;

#[tokio::test]
async fn test_positions_count_utf16_units() -> Result<()> {
    logging();
    let client = TestClient::start(server(ServerState::temporary().await?)).await?;

    let mut socket = client.connect("unicode").await?;
    socket.recv_type("document-state").await?;

    // "🎉" and "😍" are two code units each
    socket
        .send(&json!({
            "type": "op", "kind": "insert", "position": 0,
            "text": "🎉😍", "baseVersion": 0
        }))
        .await;
    let ack = socket.recv_type("ack").await?;
    assert_eq!(ack["serverVersion"], 1);

    socket
        .send(&json!({
            "type": "op", "kind": "insert", "position": 2,
            "text": "x", "baseVersion": 1
        }))
        .await;
    let ack = socket.recv_type("ack").await?;
    assert_eq!(ack["serverVersion"], 2);

    client.expect_text("unicode", "🎉x😍").await;
    Ok(())
}

#[tokio::test]
async fn test_surrogate_interior_rejected() -> Result<()> {
    logging();
    let client = TestClient::start(server(ServerState::temporary().await?)).await?;

    let mut socket = client.connect("unicode").await?;
    socket.recv_type("document-state").await?;

    socket
        .send(&json!({
            "type": "op", "kind": "insert", "position": 0,
            "text": "🎉", "baseVersion": 0
        }))
        .await;
    socket.recv_type("ack").await?;

    // offset 1 lands between the emoji's surrogate halves
    socket
        .send(&json!({
            "type": "op", "kind": "insert", "position": 1,
            "text": "x", "baseVersion": 1
        }))
        .await;
    let err = socket.recv_type("error").await?;
    assert_eq!(err["code"], "invalid_op");

    client.expect_text("unicode", "🎉").await;
    Ok(())
}

#[tokio::test]
async fn test_delete_spanning_astral_characters() -> Result<()> {
    logging();
    let client = TestClient::start(server(ServerState::temporary().await?)).await?;

    let mut socket = client.connect("unicode").await?;
    socket.recv_type("document-state").await?;

    socket
        .send(&json!({
            "type": "op", "kind": "insert", "position": 0,
            "text": "a🎉b", "baseVersion": 0
        }))
        .await;
    socket.recv_type("ack").await?;

    // delete the emoji: two code units starting at offset 1
    socket
        .send(&json!({
            "type": "op", "kind": "delete", "position": 1,
            "length": 2, "baseVersion": 1
        }))
        .await;
    let ack = socket.recv_type("ack").await?;
    assert_eq!(ack["serverVersion"], 2);

    client.expect_text("unicode", "ab").await;
    Ok(())
}

#[tokio::test]
async fn test_combining_marks_survive_edits() -> Result<()> {
    logging();
    let client = TestClient::start(server(ServerState::temporary().await?)).await?;

    let mut socket = client.connect("unicode").await?;
    socket.recv_type("document-state").await?;

    // "e" plus a combining acute accent: two code units, two chars
    socket
        .send(&json!({
            "type": "op", "kind": "insert", "position": 0,
            "text": "e\u{0301}q", "baseVersion": 0
        }))
        .await;
    socket.recv_type("ack").await?;

    socket
        .send(&json!({
            "type": "op", "kind": "delete", "position": 2,
            "length": 1, "baseVersion": 1
        }))
        .await;
    socket.recv_type("ack").await?;

    client.expect_text("unicode", "e\u{0301}").await;
    Ok(())
}
