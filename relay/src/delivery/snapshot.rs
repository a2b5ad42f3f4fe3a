use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::debug;

use crate::server::AppState;

/// GET /snapshot.jpg — the current frame, never cached.
pub async fn snapshot(State(state): State<AppState>) -> Response {
    let Some(snapshot) = state.store.get() else {
        return (StatusCode::NOT_FOUND, "No frame yet").into_response();
    };

    debug!(
        version = snapshot.version,
        bytes = snapshot.frame.len(),
        captured_at_ms = snapshot.frame.captured_at_ms(),
        "serving snapshot"
    );

    (
        [
            (header::CONTENT_TYPE, "image/jpeg"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        Body::from(snapshot.frame.data().clone()),
    )
        .into_response()
}
