// WebSocket handler for duel event streaming.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};

use super::AppState;
use crate::metrics;

/// WebSocket upgrade handler. Clients subscribe to one duel and receive
/// the engine's published events for it as JSON messages.
pub async fn ws_duel(
    ws: WebSocketUpgrade,
    Path(duel_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state, duel_id))
}

async fn handle_ws(mut socket: WebSocket, state: AppState, duel_id: String) {
    let mut rx = state.publisher.subscribe();
    metrics::CONNECTED_WEBSOCKETS.inc();

    loop {
        tokio::select! {
            // Duel event from the broadcast channel
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if event.duel_id != duel_id {
                            continue;
                        }
                        let text = match serde_json::to_string(&event) {
                            Ok(text) => text,
                            Err(e) => {
                                tracing::error!("WebSocket event serialize failed: {e}");
                                continue;
                            }
                        };
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            // Client disconnected
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        break;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(duel_id = %duel_id, "WebSocket client lagged, skipped {n} events");
                        // Continue receiving; clients resync via the snapshot route
                    }
                }
            }
            // Client message (we mostly ignore, but detect disconnect)
            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Close(_))) | None => {
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    metrics::CONNECTED_WEBSOCKETS.dec();
}
