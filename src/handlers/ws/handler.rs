//! Axum WebSocket handler.
//!
//! Upgrades the connection, splits the socket, and bridges both halves to
//! the transport-agnostic [`SessionDriver`] over channels: a spawned sender
//! task serializes outbound messages, a reader task turns socket frames into
//! [`InboundFrame`]s.

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::state::AppState;

use super::driver::{InboundFrame, SessionDriver};
use super::messages::OutgoingMessage;

const CHANNEL_BUFFER_SIZE: usize = 256;

/// WebSocket voice session endpoint.
pub async fn ws_session_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    info!("WebSocket session upgrade requested");
    ws.on_upgrade(move |socket| handle_session_socket(socket, state))
}

async fn handle_session_socket(socket: WebSocket, state: Arc<AppState>) {
    info!("WebSocket session established");

    let (mut sink, mut stream) = socket.split();

    let (out_tx, mut out_rx) = mpsc::channel::<OutgoingMessage>(CHANNEL_BUFFER_SIZE);
    let sender_task = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(e) => {
                    error!("failed to serialize outgoing message: {e}");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(json.into())).await {
                warn!("failed to send WebSocket message: {e}");
                break;
            }
        }
    });

    let (in_tx, in_rx) = mpsc::channel::<InboundFrame>(CHANNEL_BUFFER_SIZE);
    let reader_task = tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            let frame = match msg {
                Ok(Message::Binary(data)) => InboundFrame::Audio(data),
                Ok(Message::Text(text)) => InboundFrame::Text(text.to_string()),
                Ok(Message::Close(_)) => {
                    info!("WebSocket closed by client");
                    break;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Err(e) => {
                    warn!("WebSocket error: {e}");
                    break;
                }
            };
            if in_tx.send(frame).await.is_err() {
                debug!("driver stopped consuming frames");
                break;
            }
        }
    });

    let driver = SessionDriver::new(
        state.orchestrator.clone(),
        state.sessions.clone(),
        state.vad.clone(),
        state.segmenter_config,
    );
    driver.run(in_rx, out_tx).await;

    sender_task.abort();
    reader_task.abort();
    info!("WebSocket session terminated");
}
