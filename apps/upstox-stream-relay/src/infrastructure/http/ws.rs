//! Subscriber WebSocket
//!
//! Each connection registers with the broadcaster. A writer task drains the
//! subscriber's queue into the socket while the reader loop hands every text
//! frame to the command handler. Either side ending unregisters the
//! subscriber.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};

use super::AppState;

pub(super) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let broadcaster = Arc::clone(&state.broadcaster);
    let handle = broadcaster.register();
    let id = handle.id;
    let mut outbound = handle.rx;

    let (mut sink, mut stream) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sink.send(Message::Text(frame.to_string().into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            _ = &mut writer => break,
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    broadcaster.handle_subscriber_command(id, &text).await;
                }
                Some(Ok(Message::Binary(bytes))) => {
                    broadcaster
                        .handle_subscriber_command(id, &String::from_utf8_lossy(&bytes))
                        .await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(subscriber = id, error = %e, "Subscriber socket error");
                    break;
                }
            }
        }
    }

    // Dropping the queue sender lets the writer flush and close the socket.
    broadcaster.unregister(id);
}
