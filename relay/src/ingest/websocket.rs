use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{Stream, StreamExt};
use tracing::{debug, info, trace};

use crate::server::{next_connection_id, AppState};
use crate::store::FrameStore;

/// GET /stream — WebSocket upgrade for producers pushing one frame per binary message.
pub async fn ingest_websocket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let max_bytes = state.relay.max_frame_bytes;
    let store = Arc::clone(&state.store);
    ws.max_message_size(max_bytes)
        .max_frame_size(max_bytes)
        .on_upgrade(move |socket| run_session(socket, store))
}

async fn run_session(socket: WebSocket, store: Arc<FrameStore>) {
    let conn = next_connection_id();
    info!(conn, "websocket producer connected");
    let frames = ingest_messages(socket, &store, conn).await;
    info!(conn, frames, "websocket producer disconnected");
}

/// Store every binary message as a frame until the peer closes or the
/// transport fails. Other message kinds are ignored. Returns the number of
/// frames stored.
pub async fn ingest_messages<S, E>(messages: S, store: &FrameStore, conn: u64) -> u64
where
    S: Stream<Item = Result<Message, E>>,
    E: std::fmt::Display,
{
    futures_util::pin_mut!(messages);
    let mut frames: u64 = 0;

    while let Some(msg) = messages.next().await {
        match msg {
            Ok(Message::Binary(data)) => {
                if let Some(version) = store.set(data) {
                    frames += 1;
                    trace!(conn, version, "frame received");
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {} // text, ping, pong
            Err(e) => {
                debug!(conn, error = %e, "websocket receive error");
                break;
            }
        }
    }

    frames
}
