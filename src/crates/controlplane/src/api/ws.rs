//! Realtime event stream
//!
//! WebSocket clients receive every published envelope as a JSON text
//! frame. A client that reconnects sends `{"resume_from_seq": N}` and is
//! served the missed window from the durable log before live streaming
//! resumes. Lagging clients skip, they never block the publisher.

use crate::api::routes::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;

/// A client control frame
#[derive(Debug, Deserialize)]
struct ClientFrame {
    /// Replay everything after this sequence number
    resume_from_seq: Option<u64>,
}

/// Handler for `GET /v1/ws`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut tap = state.handles.bus.tap();

    loop {
        tokio::select! {
            event = tap.recv() => match event {
                Ok(event) => {
                    let Ok(frame) = serde_json::to_string(&event) else { continue };
                    if socket.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::debug!("WebSocket client lagged by {} events", missed);
                }
                Err(RecvError::Closed) => break,
            },

            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) {
                        if let Some(seq) = frame.resume_from_seq {
                            replay_window(&mut socket, &state, seq).await;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }
}

/// Send the missed window `(seq, now]` from the durable log.
async fn replay_window(socket: &mut WebSocket, state: &AppState, seq: u64) {
    let events = match state.handles.bus.log().read_range(seq + 1, u64::MAX) {
        Ok(events) => events,
        Err(e) => {
            tracing::warn!("WebSocket replay unavailable: {}", e);
            return;
        }
    };

    for event in events {
        let Ok(frame) = serde_json::to_string(&event) else { continue };
        if socket.send(Message::Text(frame)).await.is_err() {
            return;
        }
    }
}
