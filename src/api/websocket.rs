use std::sync::Arc;
use tokio::sync::mpsc;
use warp::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};

use crate::live::LiveServer;

pub async fn handle_live_websocket(websocket: WebSocket, server: Arc<LiveServer>) {
    tracing::info!("New live WebSocket connection established");

    let (mut ws_sender, mut ws_receiver) = websocket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let conn_id = server.register_connection(tx).await;

    // Spawn task to forward outbound events to the client
    let sender_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = ws_sender.send(message).await {
                tracing::error!(error = %e, "Failed to send WebSocket message");
                break;
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(message) => {
                if let Ok(text) = message.to_str() {
                    tracing::debug!(conn_id = conn_id, "Received message: {}", text);
                    server.handle_message(conn_id, text).await;
                }
            }
            Err(e) => {
                tracing::error!(conn_id = conn_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    server.handle_connection_closed(conn_id).await;
    sender_task.abort();
    tracing::info!(conn_id = conn_id, "Live WebSocket connection closed");
}
