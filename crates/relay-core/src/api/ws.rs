//! Downlink WebSocket handler: accepts a subscriber and forwards broadcast
//! messages to it until either side closes.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::downlink;

use super::AppState;

pub async fn subtitles_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    // Greet the new subscriber directly so a client that connects before
    // ingest has produced anything still sees an immediate status edge,
    // rather than silence until the next broadcast.
    let _ = tx.send(Message::Text(
        downlink::status_message("starting", "connected to relay").to_string().into(),
    ));
    let guard = state.subscribers.register(tx);
    log::debug!("subtitle subscriber {} attached", guard.id());

    let mut send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    // Subscribers never send anything meaningful upstream; draining the
    // read half is how we notice the peer closed the connection.
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(_message)) = stream.next().await {}
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    drop(guard);
}
