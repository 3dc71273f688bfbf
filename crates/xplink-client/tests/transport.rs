//! Integration tests for the streaming WebSocket transport.
//!
//! # Purpose
//!
//! These tests run the real client transport against a loopback WebSocket
//! server (`tokio_tungstenite::accept_async` on an OS-assigned port). They
//! verify what no unit test can: that an encoded request leaves the socket
//! as the JSON the simulator expects, and that the receive path classifies
//! real frames — replies, garbage, silence, and closure — correctly.
//!
//! The connection supervisor itself is not exercised here; it needs a full
//! REST + beacon environment. Its decision logic is unit-tested in the
//! application layer against planned requests instead.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use xplink_client::infrastructure::network::ws_client::{connect, next_reply, Inbound};
use xplink_core::protocol::messages::{DatarefSubscription, StreamReply, StreamRequest};

/// Binds a loopback listener and returns its `ws://` URL.
async fn loopback_listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback listener");
    let addr = listener.local_addr().expect("listener address");
    (listener, format!("ws://{addr}"))
}

// ── Round trip ────────────────────────────────────────────────────────────────

/// Sends a subscribe request and receives the acknowledgment and a value
/// update through the real encode/decode path.
#[tokio::test]
async fn test_subscribe_round_trip_over_loopback() {
    let (listener, url) = loopback_listener().await;

    // The server accepts one connection, captures the first frame, then
    // plays back a result and one update.
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = accept_async(stream).await.expect("websocket handshake");

        let inbound = match ws.next().await {
            Some(Ok(Message::Text(text))) => text,
            other => panic!("expected a text frame, got {other:?}"),
        };

        ws.send(Message::Text(
            r#"{"type": "result", "req_id": 1, "success": true}"#.to_string(),
        ))
        .await
        .expect("send result");
        ws.send(Message::Text(
            r#"{"type": "dataref_update_values", "data": {"42": 1.5}}"#.to_string(),
        ))
        .await
        .expect("send update");

        inbound
    });

    // Act: connect, subscribe, and read two replies.
    let (sender, mut source) = connect(&url).await.expect("connect");
    sender
        .send(&StreamRequest::subscribe_datarefs(
            1,
            vec![DatarefSubscription::whole(42)],
        ))
        .await
        .expect("send subscribe");

    let first = next_reply(&mut source, Duration::from_secs(2)).await;
    match first {
        Inbound::Reply(StreamReply::Result {
            req_id, success, ..
        }) => {
            assert_eq!(req_id, Some(1));
            assert!(success);
        }
        other => panic!("expected a result reply, got {other:?}"),
    }

    let second = next_reply(&mut source, Duration::from_secs(2)).await;
    match second {
        Inbound::Reply(StreamReply::DatarefUpdateValues { data }) => {
            assert_eq!(data.len(), 1);
            assert_eq!(data.get(&42).and_then(|v| v.as_f64()), Some(1.5));
        }
        other => panic!("expected a value update, got {other:?}"),
    }

    // Assert: the frame the server captured is the exact wire JSON.
    let captured = server.await.expect("server task");
    let parsed: serde_json::Value = serde_json::from_str(&captured).expect("valid JSON");
    assert_eq!(
        parsed,
        serde_json::json!({
            "type": "dataref_subscribe_values",
            "req_id": 1,
            "params": {"datarefs": [{"id": 42}]}
        })
    );
}

// ── Receive classification ────────────────────────────────────────────────────

/// A silent connection reports a timeout, not an error or a close.
#[tokio::test]
async fn test_next_reply_times_out_on_silence() {
    let (listener, url) = loopback_listener().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = accept_async(stream).await.expect("websocket handshake");
        // Hold the connection open, sending nothing, until the client is done.
        let _ = ws.next().await;
    });

    let (_sender, mut source) = connect(&url).await.expect("connect");

    let inbound = next_reply(&mut source, Duration::from_millis(120)).await;
    assert!(matches!(inbound, Inbound::TimedOut), "got {inbound:?}");

    // Both split halves co-own the socket; the server only sees the client
    // as done once the sender half is gone too.
    drop(_sender);
    drop(source);
    let _ = server.await;
}

/// An orderly close surfaces as `Closed` so the session loop can reconnect.
#[tokio::test]
async fn test_next_reply_reports_close() {
    let (listener, url) = loopback_listener().await;
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = accept_async(stream).await.expect("websocket handshake");
        ws.close(None).await.expect("close");
    });

    let (_sender, mut source) = connect(&url).await.expect("connect");

    let inbound = next_reply(&mut source, Duration::from_secs(2)).await;
    assert!(matches!(inbound, Inbound::Closed), "got {inbound:?}");
}

/// A frame that is not valid reply JSON is skipped; the following valid
/// frame still comes through. One bad producer must not kill the session.
#[tokio::test]
async fn test_undecodable_frame_is_skipped() {
    let (listener, url) = loopback_listener().await;
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = accept_async(stream).await.expect("websocket handshake");
        ws.send(Message::Text(
            r#"{"type": "mystery", "data": []}"#.to_string(),
        ))
        .await
        .expect("send mystery frame");
        ws.send(Message::Text(
            r#"{"type": "result", "req_id": 7, "success": false, "error_message": "no"}"#
                .to_string(),
        ))
        .await
        .expect("send result");
        let _ = ws.next().await;
    });

    let (_sender, mut source) = connect(&url).await.expect("connect");

    let first = next_reply(&mut source, Duration::from_secs(2)).await;
    assert!(matches!(first, Inbound::Skipped), "got {first:?}");

    let second = next_reply(&mut source, Duration::from_secs(2)).await;
    match second {
        Inbound::Reply(StreamReply::Result {
            req_id,
            success,
            error_message,
            ..
        }) => {
            assert_eq!(req_id, Some(7));
            assert!(!success);
            assert_eq!(error_message.as_deref(), Some("no"));
        }
        other => panic!("expected the result after the skipped frame, got {other:?}"),
    }
}
