//! WebSocket endpoint clients connect to for live notifications.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::message::{ClientMessage, ServerMessage};
use crate::registry::Outbound;
use crate::state::AppState;

/// Query parameters for a WebSocket connection.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Recipient the connection receives notifications for.
    pub user_id: i64,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws_handler))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, query.user_id, state))
}

async fn handle_socket(socket: WebSocket, user_id: i64, state: AppState) {
    let (tx, mut rx) = mpsc::channel::<Outbound>(state.config.ws_queue_size);
    let conn_id = state.registry.register(user_id, tx.clone());
    tracing::info!(user_id, connection_id = %conn_id, "Client connected");

    let _ = tx.try_send(
        ServerMessage::Connected {
            user_id,
            connection_id: conn_id.to_string(),
        }
        .into(),
    );

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Forward queued messages to the socket. A frame is confirmed only once
    // written; anything still queued when this stops is dropped unconfirmed.
    let mut send_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match serde_json::to_string(&outbound.message) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                    outbound.confirm();
                }
                Err(e) => tracing::error!(error = %e, "Failed to serialize message"),
            }
        }
        let _ = ws_sender.close().await;
    });

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientMessage>(text.as_str()) {
                        Ok(ClientMessage::Ping) => {
                            let _ = tx.try_send(ServerMessage::Pong.into());
                        }
                        Err(_) => {
                            tracing::debug!(
                                connection_id = %conn_id,
                                "Ignoring unrecognized client message"
                            );
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(
                        connection_id = %conn_id,
                        error = %e,
                        "WebSocket receive error"
                    );
                    break;
                }
            },
        }
    }

    state.registry.unregister(user_id, conn_id);
    drop(tx);
    if tokio::time::timeout(Duration::from_secs(1), &mut send_task)
        .await
        .is_err()
    {
        send_task.abort();
    }

    tracing::info!(user_id, connection_id = %conn_id, "Client disconnected");
}
