//! Shared fixtures: a local WebSocket server standing in for the Upstox feed.

#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use upstox_stream_relay::{AccessTokenSource, UpstreamEvent};

pub const WAIT: Duration = Duration::from_secs(5);

/// Fixed access token.
pub struct StaticToken(pub &'static str);

impl AccessTokenSource for StaticToken {
    fn current_access_token(&self) -> Option<String> {
        Some(self.0.to_string())
    }
}

/// Access token that tests can replace.
pub struct SwappableToken(Mutex<String>);

impl SwappableToken {
    pub fn new(token: &str) -> Self {
        Self(Mutex::new(token.to_string()))
    }

    pub fn set(&self, token: &str) {
        *self.0.lock() = token.to_string();
    }
}

impl AccessTokenSource for SwappableToken {
    fn current_access_token(&self) -> Option<String> {
        Some(self.0.lock().clone())
    }
}

/// Fake market data feed.
pub struct FakeUpstream {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicUsize>,
    pub live: Arc<AtomicUsize>,
    pub request_uris: Arc<Mutex<Vec<String>>>,
    pub received: mpsc::UnboundedReceiver<String>,
    push: broadcast::Sender<Message>,
}

impl FakeUpstream {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let live = Arc::new(AtomicUsize::new(0));
        let request_uris = Arc::new(Mutex::new(Vec::new()));
        let (received_tx, received) = mpsc::unbounded_channel();
        let (push, _) = broadcast::channel(64);

        let accept_connections = Arc::clone(&connections);
        let accept_live = Arc::clone(&live);
        let accept_uris = Arc::clone(&request_uris);
        let accept_push = push.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let uris = Arc::clone(&accept_uris);
                let record_uri = move |req: &Request, resp: Response| {
                    uris.lock().push(req.uri().to_string());
                    Ok(resp)
                };
                let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, record_uri).await else {
                    continue;
                };
                accept_connections.fetch_add(1, Ordering::SeqCst);
                accept_live.fetch_add(1, Ordering::SeqCst);
                let live = Arc::clone(&accept_live);
                let received = received_tx.clone();
                let push = accept_push.subscribe();
                tokio::spawn(async move {
                    serve_connection(ws, received, push).await;
                    live.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        Self {
            addr,
            connections,
            live,
            request_uris,
            received,
            push,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/v2/feed/market-data-feed", self.addr)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Connections still being served.
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Send a frame on every open connection.
    pub fn push(&self, message: Message) {
        let _ = self.push.send(message);
    }

    /// Next text frame a client sent upstream.
    pub async fn next_received(&mut self) -> String {
        timeout(WAIT, self.received.recv()).await.unwrap().unwrap()
    }
}

async fn serve_connection(
    ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    received: mpsc::UnboundedSender<String>,
    mut push: broadcast::Receiver<Message>,
) {
    let (mut write, mut read) = ws.split();
    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let _ = received.send(text.to_string());
                }
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            Ok(outbound) = push.recv() => {
                let closing = matches!(outbound, Message::Close(_));
                let _ = write.send(outbound).await;
                if closing {
                    break;
                }
            }
        }
    }
}

/// Wait for the next event matching `pred`, skipping others.
pub async fn wait_for_event(
    events: &mut mpsc::Receiver<UpstreamEvent>,
    pred: impl Fn(&UpstreamEvent) -> bool,
) -> UpstreamEvent {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for upstream event")
}

pub async fn wait_connected(events: &mut mpsc::Receiver<UpstreamEvent>) {
    wait_for_event(events, |e| matches!(e, UpstreamEvent::Connected)).await;
}
