//! Upstream Feed Integration Tests
//!
//! Drives `UpstreamFeed` against a local WebSocket server: connect
//! idempotence, subscribe forwarding, opaque relay, and reconnect.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use common::{FakeUpstream, StaticToken, SwappableToken, wait_connected, wait_for_event};
use upstox_stream_relay::infrastructure::upstox::ReconnectConfig;
use upstox_stream_relay::{
    ConnectAttempt, ConnectionState, FeedClientConfig, SubscriptionForwarder, SubscriptionRequest,
    UndeliverableCommand, UpstreamEvent, UpstreamFeed,
};

fn start_feed(
    upstream: &FakeUpstream,
    reconnect: ReconnectConfig,
) -> (Arc<UpstreamFeed>, mpsc::Receiver<UpstreamEvent>, CancellationToken) {
    let (tx, rx) = mpsc::channel(256);
    let cancel = CancellationToken::new();
    let config = FeedClientConfig {
        reconnect,
        ..FeedClientConfig::new(upstream.url())
    };
    let feed = UpstreamFeed::new(config, Arc::new(StaticToken("tok-1")), tx, cancel.clone())
        .unwrap();
    (Arc::new(feed), rx, cancel)
}

#[tokio::test]
async fn repeated_connect_keeps_one_session() {
    let upstream = FakeUpstream::start().await;
    let (feed, mut events, cancel) = start_feed(&upstream, ReconnectConfig::default());

    assert_eq!(feed.connect(), ConnectAttempt::Started);
    assert_eq!(feed.connect(), ConnectAttempt::AlreadyActive);
    wait_connected(&mut events).await;
    assert_eq!(feed.connect(), ConnectAttempt::AlreadyActive);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(upstream.connection_count(), 1);
    assert_eq!(feed.state(), ConnectionState::Open);

    let uris = upstream.request_uris.lock().clone();
    assert_eq!(uris.len(), 1);
    assert!(uris[0].contains("access_token=tok-1"), "uri was {}", uris[0]);

    cancel.cancel();
}

#[tokio::test]
async fn subscribe_is_forwarded_only_while_open() {
    let mut upstream = FakeUpstream::start().await;
    let (feed, mut events, cancel) = start_feed(&upstream, ReconnectConfig::default());
    let request = SubscriptionRequest::new(["RELIANCE", "INFY"]);

    assert_eq!(
        feed.forward_subscription(&request),
        Err(UndeliverableCommand::NotConnected)
    );

    feed.connect();
    wait_connected(&mut events).await;
    feed.forward_subscription(&request).unwrap();

    let sent: Value = serde_json::from_str(&upstream.next_received().await).unwrap();
    assert_eq!(
        sent,
        json!({"action": "subscribe", "symbols": ["INFY", "RELIANCE"]})
    );

    // Nothing was queued from the disconnected attempt.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(upstream.received.try_recv().is_err());

    cancel.cancel();
}

#[tokio::test]
async fn upstream_payloads_are_relayed_in_order() {
    let upstream = FakeUpstream::start().await;
    let (feed, mut events, cancel) = start_feed(&upstream, ReconnectConfig::default());

    feed.connect();
    wait_connected(&mut events).await;

    upstream.push(Message::Text(r#"{"feeds":{"NSE_EQ|INFY":{"ltp":1523.4}}}"#.into()));
    upstream.push(Message::Text("market closed".into()));
    upstream.push(Message::Binary(b"\x01\x02raw".to_vec().into()));

    let mut payloads = Vec::new();
    while payloads.len() < 3 {
        if let UpstreamEvent::Message(envelope) =
            wait_for_event(&mut events, |e| matches!(e, UpstreamEvent::Message(_))).await
        {
            assert_eq!(envelope.source, "upstream");
            payloads.push(envelope.data);
        }
    }

    assert_eq!(payloads[0], json!({"feeds": {"NSE_EQ|INFY": {"ltp": 1523.4}}}));
    assert_eq!(payloads[1], json!("market closed"));
    assert_eq!(payloads[2], json!("\u{1}\u{2}raw"));
    assert_eq!(feed.messages_received(), 3);

    cancel.cancel();
}

#[tokio::test]
async fn upstream_close_reconnects_once_and_restores_subscriptions() {
    let mut upstream = FakeUpstream::start().await;
    let (feed, mut events, cancel) =
        start_feed(&upstream, ReconnectConfig::fixed(Duration::from_millis(50)));

    feed.connect();
    wait_connected(&mut events).await;
    feed.forward_subscription(&SubscriptionRequest::new(["TCS"]))
        .unwrap();
    upstream.next_received().await;

    upstream.push(Message::Close(None));

    wait_for_event(&mut events, |e| matches!(e, UpstreamEvent::Disconnected { .. })).await;
    let reconnecting = wait_for_event(&mut events, |e| {
        matches!(e, UpstreamEvent::Reconnecting { .. })
    })
    .await;
    assert!(matches!(
        reconnecting,
        UpstreamEvent::Reconnecting { attempt: 1, delay } if delay == Duration::from_millis(50)
    ));
    wait_connected(&mut events).await;

    let restored: Value = serde_json::from_str(&upstream.next_received().await).unwrap();
    assert_eq!(restored, json!({"action": "subscribe", "symbols": ["TCS"]}));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(upstream.connection_count(), 2);
    assert_eq!(feed.reconnect_count(), 1);
    assert!(!feed.has_pending_reconnect());

    cancel.cancel();
}

#[tokio::test]
async fn shutdown_closes_without_reconnect() {
    let upstream = FakeUpstream::start().await;
    let (feed, mut events, _cancel) =
        start_feed(&upstream, ReconnectConfig::fixed(Duration::from_millis(20)));

    feed.connect();
    wait_connected(&mut events).await;

    feed.shutdown();
    wait_for_event(&mut events, |e| matches!(e, UpstreamEvent::Disconnected { .. })).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(feed.state(), ConnectionState::Disconnected);
    assert_eq!(feed.reconnect_count(), 0);
    assert_eq!(upstream.connection_count(), 1);
}

#[tokio::test]
async fn rotation_reopens_session_with_new_token() {
    let upstream = FakeUpstream::start().await;
    let (tx, mut events) = mpsc::channel(256);
    let cancel = CancellationToken::new();
    let token = Arc::new(SwappableToken::new("token-a"));
    let feed = Arc::new(
        UpstreamFeed::new(
            FeedClientConfig::new(upstream.url()),
            token.clone(),
            tx,
            cancel.clone(),
        )
        .unwrap(),
    );
    let (rotations_tx, rotations_rx) = watch::channel(0_u64);
    tokio::spawn(Arc::clone(&feed).follow_rotations(rotations_rx));

    feed.connect();
    wait_connected(&mut events).await;

    token.set("token-b");
    rotations_tx.send_modify(|generation| *generation += 1);
    wait_connected(&mut events).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(feed.state(), ConnectionState::Open);
    assert_eq!(upstream.connection_count(), 2);
    assert_eq!(upstream.live_count(), 1);
    assert_eq!(feed.reconnect_count(), 0);
    assert!(!feed.has_pending_reconnect());

    let uris = upstream.request_uris.lock().clone();
    assert!(uris[0].contains("access_token=token-a"), "uri was {}", uris[0]);
    assert!(uris[1].contains("access_token=token-b"), "uri was {}", uris[1]);

    cancel.cancel();
}

#[tokio::test]
async fn stalled_handshake_times_out_and_reconnects() {
    // Accepts TCP but never answers the upgrade request.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            held.push(stream);
        }
    });

    let (tx, mut events) = mpsc::channel(256);
    let cancel = CancellationToken::new();
    let config = FeedClientConfig {
        reconnect: ReconnectConfig::fixed(Duration::from_millis(50)),
        handshake_timeout: Duration::from_millis(100),
        ..FeedClientConfig::new(format!("ws://{addr}/feed"))
    };
    let feed = Arc::new(
        UpstreamFeed::new(config, Arc::new(StaticToken("tok-1")), tx, cancel.clone()).unwrap(),
    );

    assert_eq!(feed.connect(), ConnectAttempt::Started);

    let UpstreamEvent::Disconnected { reason } =
        wait_for_event(&mut events, |e| matches!(e, UpstreamEvent::Disconnected { .. })).await
    else {
        unreachable!()
    };
    assert!(reason.contains("timed out"), "reason was {reason}");
    wait_for_event(&mut events, |e| {
        matches!(e, UpstreamEvent::Reconnecting { attempt: 1, .. })
    })
    .await;

    // The timer fires and the next attempt reaches the listener.
    wait_for_event(&mut events, |e| {
        matches!(e, UpstreamEvent::Reconnecting { attempt: 2, .. })
    })
    .await;
    assert!(accepted.load(Ordering::SeqCst) >= 2);
    assert_ne!(feed.state(), ConnectionState::Open);

    cancel.cancel();
}
