use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use frame_relay_common::frame::Frame;
use futures_util::{stream, Stream, StreamExt};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::server::{next_connection_id, AppState};
use crate::store::FrameStore;

/// Boundary literal used between parts of the viewer stream.
pub const BOUNDARY: &str = "frame";

/// Per-viewer record of what has already been pushed.
///
/// Only the version of the last frame sent is kept, so a viewer never has
/// more than one frame pending: any number of store updates between two
/// polls collapse into the frame that is current at poll time.
#[derive(Debug, Default)]
pub struct DeliverySession {
    last_sent: u64,
}

impl DeliverySession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current frame if it has not been sent to this viewer yet.
    pub fn poll(&mut self, store: &FrameStore) -> Option<Frame> {
        let snapshot = store.get()?;
        if snapshot.version == self.last_sent {
            return None;
        }
        self.last_sent = snapshot.version;
        Some(snapshot.frame)
    }

    pub fn last_sent(&self) -> u64 {
        self.last_sent
    }
}

/// Encode one frame as a multipart part, including its leading boundary line.
pub fn encode_part(frame: &Frame) -> Bytes {
    let head = format!(
        "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        frame.len()
    );
    let mut buf = BytesMut::with_capacity(head.len() + frame.len() + 2);
    buf.extend_from_slice(head.as_bytes());
    buf.extend_from_slice(frame.data());
    buf.extend_from_slice(b"\r\n");
    buf.freeze()
}

/// Polling state owned by one viewer's response body. Dropping it (when the
/// viewer disconnects and the body is discarded) also drops the timer.
struct ViewerPush {
    store: Arc<FrameStore>,
    ticker: Interval,
    session: DeliverySession,
    conn: u64,
    frames_sent: u64,
}

impl Drop for ViewerPush {
    fn drop(&mut self) {
        info!(
            conn = self.conn,
            frames_sent = self.frames_sent,
            "mjpeg viewer disconnected"
        );
    }
}

/// Stream of encoded parts for one viewer: the current frame right away
/// (if any), then each newer frame seen on a poll tick.
pub fn frame_parts(
    store: Arc<FrameStore>,
    poll_interval: Duration,
    conn: u64,
) -> impl Stream<Item = Bytes> {
    // The first tick completes immediately, giving the initial push.
    let mut ticker = tokio::time::interval(poll_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let push = ViewerPush {
        store,
        ticker,
        session: DeliverySession::new(),
        conn,
        frames_sent: 0,
    };

    stream::unfold(push, |mut push| async move {
        loop {
            push.ticker.tick().await;
            if let Some(frame) = push.session.poll(&push.store) {
                push.frames_sent += 1;
                debug!(
                    conn = push.conn,
                    version = push.session.last_sent(),
                    bytes = frame.len(),
                    age_ms = frame.age_ms(chrono::Utc::now().timestamp_millis()),
                    "pushing frame"
                );
                return Some((encode_part(&frame), push));
            }
        }
    })
}

/// GET /mjpeg — continuous multipart stream of the latest frames.
pub async fn stream_mjpeg(State(state): State<AppState>) -> Response {
    let conn = next_connection_id();
    info!(conn, version = state.store.version(), "mjpeg viewer connected");

    let parts = frame_parts(Arc::clone(&state.store), state.relay.poll_interval(), conn)
        .map(Ok::<_, Infallible>);

    (
        [
            (
                header::CONTENT_TYPE,
                format!("multipart/x-mixed-replace; boundary={BOUNDARY}"),
            ),
            (
                header::CACHE_CONTROL,
                "no-cache, no-store, must-revalidate".to_string(),
            ),
            (header::PRAGMA, "no-cache".to_string()),
            (header::EXPIRES, "0".to_string()),
            (header::CONNECTION, "close".to_string()),
        ],
        Body::from_stream(parts),
    )
        .into_response()
}
