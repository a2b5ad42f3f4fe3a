use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use frame_relay_common::config::RelayConfig;
use tower_http::trace::TraceLayer;

use crate::delivery::{mjpeg, snapshot};
use crate::ingest::{multipart, websocket};
use crate::store::FrameStore;

static CONNECTION_SEQ: AtomicU64 = AtomicU64::new(1);

/// Id used to correlate log lines of one producer or viewer connection.
pub fn next_connection_id() -> u64 {
    CONNECTION_SEQ.fetch_add(1, Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

/// Shared by every handler. The store is the only mutable state in the
/// process and lives as long as the router does.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<FrameStore>,
    pub relay: RelayConfig,
}

impl AppState {
    pub fn new(store: Arc<FrameStore>, relay: RelayConfig) -> Self {
        Self { store, relay }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(viewer_page))
        .route(
            "/stream",
            get(websocket::ingest_websocket).post(multipart::ingest_multipart),
        )
        .route("/mjpeg", get(mjpeg::stream_mjpeg))
        .route("/snapshot.jpg", get(snapshot::snapshot))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

const VIEWER_HTML: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>Screen Stream Viewer</title></head>
<body>
  <h1>Latest Frame</h1>
  <p><a href="/mjpeg">MJPEG Stream</a> | <a href="/snapshot.jpg">Snapshot</a></p>
  <img id="img" src="/snapshot.jpg" style="max-width:100%;" />
  <script>
    setInterval(() => {
      const img = document.getElementById('img');
      img.src = '/snapshot.jpg?_=' + Date.now();
    }, 1000);
  </script>
</body>
</html>"#;

/// GET / — minimal page that refreshes the snapshot once per second.
async fn viewer_page() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/html")], VIEWER_HTML)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::mjpeg::encode_part;
    use bytes::Bytes;
    use frame_relay_common::frame::Frame;
    use futures_util::{stream, SinkExt, StreamExt};
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    async fn spawn_relay() -> (String, Arc<FrameStore>) {
        spawn_relay_with(RelayConfig::default()).await
    }

    async fn spawn_relay_with(relay: RelayConfig) -> (String, Arc<FrameStore>) {
        let store = Arc::new(FrameStore::new());
        let state = AppState::new(Arc::clone(&store), relay);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        (format!("http://{addr}"), store)
    }

    /// Wait until the store reaches `version`; ingest runs on server tasks.
    async fn wait_for_version(store: &FrameStore, version: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.version() < version {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn fetch_snapshot(base: &str) -> Bytes {
        let resp = reqwest::get(format!("{base}/snapshot.jpg")).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        resp.bytes().await.unwrap()
    }

    fn multipart_body(boundary: &str, parts: &[Vec<u8>]) -> Vec<u8> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
            body.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
            body.extend_from_slice(part);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
        body
    }

    #[tokio::test]
    async fn snapshot_before_any_frame_is_not_found() {
        let (base, _store) = spawn_relay().await;
        let resp = reqwest::get(format!("{base}/snapshot.jpg")).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
        assert_eq!(resp.text().await.unwrap(), "No frame yet");
    }

    #[tokio::test]
    async fn snapshot_follows_latest_frame() {
        let (base, store) = spawn_relay().await;
        let f1 = vec![0xA1; 100];
        let f2 = vec![0xB2; 80];

        store.set(f1.clone());
        let resp = reqwest::get(format!("{base}/snapshot.jpg")).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "image/jpeg");
        assert_eq!(resp.headers()["cache-control"], "no-store");
        assert_eq!(resp.bytes().await.unwrap().as_ref(), f1.as_slice());

        store.set(f2.clone());
        let resp = reqwest::get(format!("{base}/snapshot.jpg?_=12345")).await.unwrap();
        assert_eq!(resp.bytes().await.unwrap().as_ref(), f2.as_slice());
    }

    #[tokio::test]
    async fn multipart_post_without_boundary_is_rejected() {
        let (base, store) = spawn_relay().await;
        let resp = reqwest::Client::new()
            .post(format!("{base}/stream"))
            .header("content-type", "multipart/x-mixed-replace")
            .body(multipart_body("X", &[vec![1; 10]]))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
        assert_eq!(resp.text().await.unwrap(), "Missing boundary");
        assert!(store.get().is_none());
    }

    #[tokio::test]
    async fn multipart_post_stores_parts_in_order() {
        let (base, store) = spawn_relay().await;
        let resp = reqwest::Client::new()
            .post(format!("{base}/stream"))
            .header("content-type", "multipart/x-mixed-replace; boundary=X")
            .body(multipart_body("X", &[vec![0x50; 50], vec![0x60; 60]]))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "text/plain");
        assert_eq!(resp.text().await.unwrap(), "OK\n");

        let snapshot = store.get().unwrap();
        assert_eq!(snapshot.frame.data().as_ref(), vec![0x60; 60].as_slice());
        assert_eq!(snapshot.version, 2);
    }

    #[tokio::test]
    async fn malformed_multipart_aborts_connection_only() {
        let (base, store) = spawn_relay().await;
        let mut body = b"--X\r\n\r\nfirst\r\n--X\r\n".to_vec();
        body.extend_from_slice(b"no colon here\r\n\r\nsecond\r\n--X--\r\n");

        let result = reqwest::Client::new()
            .post(format!("{base}/stream"))
            .header("content-type", "multipart/x-mixed-replace; boundary=X")
            .body(body)
            .send()
            .await;
        if let Ok(resp) = result {
            assert!(resp.text().await.is_err());
        }
        assert_eq!(store.get().unwrap().frame.data().as_ref(), b"first");

        // The server keeps serving other connections.
        let resp = reqwest::get(format!("{base}/snapshot.jpg")).await.unwrap();
        assert_eq!(resp.bytes().await.unwrap().as_ref(), b"first");
    }

    #[tokio::test]
    async fn mjpeg_pushes_current_and_newer_frames() {
        let (base, store) = spawn_relay().await;
        store.set(vec![0x01; 32]);

        let mut resp = reqwest::get(format!("{base}/mjpeg")).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        assert_eq!(
            resp.headers()["content-type"],
            "multipart/x-mixed-replace; boundary=frame"
        );
        assert_eq!(
            resp.headers()["cache-control"],
            "no-cache, no-store, must-revalidate"
        );
        assert_eq!(resp.headers()["pragma"], "no-cache");
        assert_eq!(resp.headers()["expires"], "0");
        assert_eq!(resp.headers()["connection"], "close");

        let first = encode_part(&Frame::with_timestamp(vec![0x01; 32], 0));
        let second = encode_part(&Frame::with_timestamp(vec![0x02; 48], 0));
        let mut expected = first.to_vec();

        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while received.len() < expected.len() {
                let chunk = resp.chunk().await.unwrap().unwrap();
                received.extend_from_slice(&chunk);
            }
        })
        .await
        .unwrap();
        assert_eq!(received, expected);

        store.set(vec![0x02; 48]);
        expected.extend_from_slice(&second);
        tokio::time::timeout(Duration::from_secs(5), async {
            while received.len() < expected.len() {
                let chunk = resp.chunk().await.unwrap().unwrap();
                received.extend_from_slice(&chunk);
            }
        })
        .await
        .unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn websocket_frames_reach_snapshot() {
        let (base, store) = spawn_relay().await;
        let ws_url = format!("{}/stream", base.replacen("http", "ws", 1));
        let (mut ws, _) = tokio_tungstenite::connect_async(ws_url).await.unwrap();

        let f1 = vec![0xF1; 100];
        ws.send(WsMessage::Binary(f1.clone())).await.unwrap();
        wait_for_version(&store, 1).await;
        assert_eq!(fetch_snapshot(&base).await.as_ref(), f1.as_slice());

        let f2 = vec![0xF2; 80];
        ws.send(WsMessage::Text("not a frame".to_string())).await.unwrap();
        ws.send(WsMessage::Binary(f2.clone())).await.unwrap();
        wait_for_version(&store, 2).await;
        assert_eq!(fetch_snapshot(&base).await.as_ref(), f2.as_slice());
        assert_eq!(store.version(), 2);

        ws.close(None).await.unwrap();
    }

    #[tokio::test]
    async fn oversized_websocket_message_ends_session() {
        let relay = RelayConfig {
            max_frame_bytes: 1024,
            ..RelayConfig::default()
        };
        let (base, store) = spawn_relay_with(relay).await;
        let ws_url = format!("{}/stream", base.replacen("http", "ws", 1));
        let (mut ws, _) = tokio_tungstenite::connect_async(ws_url).await.unwrap();

        ws.send(WsMessage::Binary(vec![0x01; 512])).await.unwrap();
        wait_for_version(&store, 1).await;

        // The server drops the session; the client sees a close, an error
        // or the end of the stream, but never another frame.
        let _ = ws.send(WsMessage::Binary(vec![0x02; 4096])).await;
        let ended = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match ws.next().await {
                    None | Some(Err(_)) | Some(Ok(WsMessage::Close(_))) => break,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(ended.is_ok());

        let snapshot = store.get().unwrap();
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.frame.data().as_ref(), &[0x01u8; 512]);
    }

    #[tokio::test]
    async fn open_multipart_upload_stores_frames_as_they_complete() {
        let (base, store) = spawn_relay().await;
        let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(1);
        let body = stream::unfold(rx, |mut rx| async move {
            rx.recv()
                .await
                .map(|chunk| (Ok::<_, std::io::Error>(chunk), rx))
        });

        let upload = tokio::spawn(async move {
            let resp = reqwest::Client::new()
                .post(format!("{base}/stream"))
                .header("content-type", "multipart/x-mixed-replace; boundary=X")
                .body(reqwest::Body::wrap_stream(body))
                .send()
                .await
                .unwrap();
            let status = resp.status();
            (status, resp.text().await.unwrap())
        });

        // Each chunk carries a whole part and the delimiter that closes it,
        // so the part completes without waiting for the next chunk. 10 parts
        // of 500 KB push the body well past axum's default 2 MB limit.
        tx.send(Bytes::from_static(b"--X")).await.unwrap();
        for i in 1..=10u8 {
            let mut chunk = b"\r\n\r\n".to_vec();
            chunk.extend(std::iter::repeat(i).take(500_000));
            chunk.extend_from_slice(b"\r\n--X");
            tx.send(Bytes::from(chunk)).await.unwrap();

            wait_for_version(&store, i as u64).await;
            let snapshot = store.get().unwrap();
            assert_eq!(snapshot.frame.len(), 500_000);
            assert_eq!(snapshot.frame.data()[0], i);
            assert!(!upload.is_finished(), "upload ended while producer still streaming");
        }

        // Closing between parts is a normal end of the producer's stream.
        drop(tx);
        let (status, text) = tokio::time::timeout(Duration::from_secs(5), upload)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, reqwest::StatusCode::OK);
        assert_eq!(text, "OK\n");
        assert_eq!(store.version(), 10);
    }

    #[tokio::test]
    async fn stream_get_without_upgrade_is_client_error() {
        let (base, _store) = spawn_relay().await;
        let resp = reqwest::get(format!("{base}/stream")).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn viewer_page_links_endpoints() {
        let (base, _store) = spawn_relay().await;
        let resp = reqwest::get(format!("{base}/")).await.unwrap();
        assert_eq!(resp.headers()["content-type"], "text/html");
        let html = resp.text().await.unwrap();
        assert!(html.contains("/snapshot.jpg"));
        assert!(html.contains("/mjpeg"));
    }

    #[test]
    fn connection_ids_are_unique() {
        let a = next_connection_id();
        let b = next_connection_id();
        assert_ne!(a, b);
    }
}
