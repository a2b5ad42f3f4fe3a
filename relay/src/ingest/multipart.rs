use std::io;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use futures_util::{future, stream, Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::server::{next_connection_id, AppState};
use crate::store::FrameStore;

/// Largest header block accepted for a single part.
const MAX_HEADER_BYTES: usize = 16 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum MultipartError {
    #[error("content type has no boundary parameter")]
    MissingBoundary,
    #[error("unexpected bytes after boundary delimiter")]
    MalformedDelimiter,
    #[error("invalid part header line {0:?}")]
    InvalidHeader(String),
    #[error("part headers exceed {MAX_HEADER_BYTES} bytes")]
    HeadersTooLarge,
    #[error("part exceeds {limit} bytes")]
    PartTooLarge { limit: usize },
    #[error("unexpected end of multipart data")]
    UnexpectedEnd,
}

/// Extract the boundary token from a `Content-Type` value such as
/// `multipart/x-mixed-replace; boundary=frame`.
pub fn parse_boundary(content_type: &str) -> Result<String, MultipartError> {
    const KEY: &str = "boundary=";
    let start = content_type
        .to_ascii_lowercase()
        .find(KEY)
        .ok_or(MultipartError::MissingBoundary)?
        + KEY.len();
    let value = content_type[start..]
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .trim_matches('"');
    if value.is_empty() {
        return Err(MultipartError::MissingBoundary);
    }
    Ok(value.to_string())
}

/// Parse state for an inbound multipart body.
enum ParseState {
    /// Skipping the preamble until the first delimiter.
    SeekingBoundary,
    /// Consumed a delimiter, waiting for the end of its line.
    AfterBoundary,
    /// Reading a part's header block.
    Headers,
    /// Collecting part bytes until the next delimiter.
    CollectingPart,
    /// Close delimiter seen; the rest is epilogue.
    Finished,
}

/// Incremental splitter for a multipart body whose parts are frames.
///
/// Bytes are pushed in arbitrary chunks; every completed non-empty part is
/// handed to the caller as soon as its closing delimiter arrives.
pub struct PartParser {
    /// `\r\n--<boundary>`
    delimiter: Vec<u8>,
    state: ParseState,
    buffer: BytesMut,
    /// Offset in `buffer` where the next delimiter scan of a part starts.
    scan_from: usize,
    max_part_bytes: usize,
}

impl PartParser {
    pub fn new(boundary: &str, max_part_bytes: usize) -> Self {
        let mut delimiter = b"\r\n--".to_vec();
        delimiter.extend_from_slice(boundary.as_bytes());

        let mut buffer = BytesMut::with_capacity(256 * 1024);
        // A body may open with the delimiter without a leading CRLF.
        buffer.extend_from_slice(b"\r\n");

        Self {
            delimiter,
            state: ParseState::SeekingBoundary,
            buffer,
            scan_from: 0,
            max_part_bytes,
        }
    }

    /// Feed the next chunk of the body. Completed parts are passed to
    /// `on_part` in order, including those finished before an error.
    pub fn push(
        &mut self,
        chunk: &[u8],
        mut on_part: impl FnMut(Bytes),
    ) -> Result<(), MultipartError> {
        if matches!(self.state, ParseState::Finished) {
            return Ok(());
        }
        self.buffer.extend_from_slice(chunk);

        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, &self.delimiter) {
                        let _ = self.buffer.split_to(pos + self.delimiter.len());
                        self.state = ParseState::AfterBoundary;
                    } else {
                        // Keep a tail in case the delimiter spans chunks
                        let keep = self.delimiter.len() - 1;
                        if self.buffer.len() > keep {
                            let _ = self.buffer.split_to(self.buffer.len() - keep);
                        }
                        break;
                    }
                }
                ParseState::AfterBoundary => {
                    if self.buffer.len() < 2 {
                        break;
                    }
                    if self.buffer.starts_with(b"--") {
                        self.buffer.clear();
                        self.state = ParseState::Finished;
                        break;
                    }
                    match find_subsequence(&self.buffer, b"\r\n") {
                        Some(pos) => {
                            if !self.buffer[..pos].iter().all(is_lwsp) {
                                return Err(MultipartError::MalformedDelimiter);
                            }
                            let _ = self.buffer.split_to(pos + 2);
                            self.state = ParseState::Headers;
                        }
                        None => {
                            let last = self.buffer.len() - 1;
                            let pending_ok = self
                                .buffer
                                .iter()
                                .enumerate()
                                .all(|(i, b)| is_lwsp(b) || (i == last && *b == b'\r'));
                            if !pending_ok {
                                return Err(MultipartError::MalformedDelimiter);
                            }
                            if self.buffer.len() > MAX_HEADER_BYTES {
                                return Err(MultipartError::HeadersTooLarge);
                            }
                            break;
                        }
                    }
                }
                ParseState::Headers => {
                    if self.buffer.starts_with(b"\r\n") {
                        let _ = self.buffer.split_to(2);
                        self.scan_from = 0;
                        self.state = ParseState::CollectingPart;
                        continue;
                    }
                    match find_subsequence(&self.buffer, b"\r\n\r\n") {
                        Some(pos) => {
                            validate_headers(&self.buffer[..pos])?;
                            let _ = self.buffer.split_to(pos + 4);
                            self.scan_from = 0;
                            self.state = ParseState::CollectingPart;
                        }
                        None => {
                            if self.buffer.len() > MAX_HEADER_BYTES {
                                return Err(MultipartError::HeadersTooLarge);
                            }
                            break;
                        }
                    }
                }
                ParseState::CollectingPart => {
                    if let Some(pos) =
                        find_subsequence(&self.buffer[self.scan_from..], &self.delimiter)
                    {
                        let end = self.scan_from + pos;
                        if end > self.max_part_bytes {
                            return Err(MultipartError::PartTooLarge {
                                limit: self.max_part_bytes,
                            });
                        }
                        let part = self.buffer.split_to(end).freeze();
                        let _ = self.buffer.split_to(self.delimiter.len());
                        self.scan_from = 0;
                        self.state = ParseState::AfterBoundary;
                        if !part.is_empty() {
                            on_part(part);
                        }
                    } else {
                        if self.buffer.len() > self.max_part_bytes + self.delimiter.len() {
                            return Err(MultipartError::PartTooLarge {
                                limit: self.max_part_bytes,
                            });
                        }
                        // Avoid re-scanning bytes that cannot start a delimiter
                        self.scan_from = self
                            .buffer
                            .len()
                            .saturating_sub(self.delimiter.len() - 1);
                        break;
                    }
                }
                ParseState::Finished => {
                    self.buffer.clear();
                    break;
                }
            }
        }
        Ok(())
    }

    /// Called once the body has ended. Fails if the body stopped inside a part.
    pub fn finish(&self) -> Result<(), MultipartError> {
        match self.state {
            ParseState::Headers | ParseState::CollectingPart => Err(MultipartError::UnexpectedEnd),
            _ => Ok(()),
        }
    }
}

fn is_lwsp(b: &u8) -> bool {
    matches!(b, b' ' | b'\t')
}

/// Every header line must be `name: value` or a folded continuation line.
fn validate_headers(block: &[u8]) -> Result<(), MultipartError> {
    for line in block.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let folded = line.first().is_some_and(is_lwsp);
        if !folded && !line.contains(&b':') {
            return Err(MultipartError::InvalidHeader(
                String::from_utf8_lossy(line).into_owned(),
            ));
        }
    }
    Ok(())
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Drive `parser` over a request body, storing each completed part.
///
/// A body read error means the producer went away and ends the session
/// normally. Returns the number of frames stored.
pub async fn pump_parts<S, E>(
    body: S,
    mut parser: PartParser,
    store: &FrameStore,
    conn: u64,
) -> Result<u64, MultipartError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    futures_util::pin_mut!(body);
    let mut frames: u64 = 0;

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                debug!(conn, error = %e, "multipart body read ended");
                return Ok(frames);
            }
        };
        parser.push(&chunk, |part| {
            if store.set(part).is_some() {
                frames += 1;
            }
        })?;
    }

    parser.finish()?;
    Ok(frames)
}

/// POST /stream — multipart frame upload.
///
/// Answers `OK` right away and keeps the response open until the producer's
/// body ends. A framing error aborts the connection.
pub async fn ingest_multipart(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let boundary = match parse_boundary(content_type) {
        Ok(b) => b,
        Err(e) => {
            warn!(content_type, error = %e, "rejecting multipart ingest");
            return (StatusCode::BAD_REQUEST, "Missing boundary").into_response();
        }
    };

    let conn = next_connection_id();
    info!(conn, boundary, "multipart producer connected");

    let parser = PartParser::new(&boundary, state.relay.max_frame_bytes);
    let store = Arc::clone(&state.store);
    let session = async move {
        let result = pump_parts(body.into_data_stream(), parser, &store, conn).await;
        finish_session(result, conn)
    };

    let ack = stream::once(future::ready(Ok(Bytes::from_static(b"OK\n"))));
    let tail = stream::once(session).filter_map(future::ready);

    (
        [(header::CONTENT_TYPE, "text/plain")],
        Body::from_stream(ack.chain(tail)),
    )
        .into_response()
}

/// Turn the session outcome into the last item of the response body.
fn finish_session(
    result: Result<u64, MultipartError>,
    conn: u64,
) -> Option<Result<Bytes, io::Error>> {
    match result {
        Ok(frames) => {
            info!(conn, frames, "multipart producer disconnected");
            None
        }
        Err(e) => {
            warn!(conn, error = %e, "multipart stream failed");
            Some(Err(io::Error::new(io::ErrorKind::InvalidData, e)))
        }
    }
}
