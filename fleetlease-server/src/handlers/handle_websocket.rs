use std::time::Duration;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use fleetlease_core::coordinator::{ClientMessage, ErrorKind, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::infra::app_state::AppState;

/// Upgrades a worker connection.
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let coordinator = state.coordinator.clone();
    let (connection, mut rx) = coordinator.connect();
    let closed = connection.closed_token();
    info!(connection_id = %connection.id, "worker connected");

    let writer_closed = closed.clone();
    let writer = tokio::spawn(async move {
        loop {
            // Queued frames (a final control message) go out before close.
            let message = tokio::select! {
                biased;
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
                _ = writer_closed.cancelled() => break,
            };
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(err) => {
                    warn!(error = %err, "failed to encode server message");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            _ = state.shutdown.cancelled() => break,
            frame = ws_receiver.next() => frame,
        };
        let Some(frame) = frame else { break };
        let parsed = match frame {
            Ok(Message::Text(text)) => serde_json::from_str::<ClientMessage>(text.as_str()),
            Ok(Message::Binary(bin)) => serde_json::from_slice::<ClientMessage>(bin.as_ref()),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!(connection_id = %connection.id, error = %err, "websocket read failed");
                break;
            }
        };
        match parsed {
            Ok(message) => coordinator.handle_message(&connection, message).await,
            Err(err) => {
                warn!(connection_id = %connection.id, error = %err, "malformed worker frame");
                connection
                    .send(ServerMessage::error(
                        ErrorKind::Protocol,
                        format!("malformed message: {err}"),
                    ))
                    .await;
            }
        }
    }

    coordinator.disconnect(connection.id, "socket closed").await;
    let mut writer = writer;
    if tokio::time::timeout(Duration::from_secs(1), &mut writer).await.is_err() {
        writer.abort();
    }
}
