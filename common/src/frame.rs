use bytes::Bytes;

/// JPEG start-of-image marker.
const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

/// One complete video frame as received from a producer.
///
/// The payload is treated as opaque JPEG bytes; the relay never decodes it.
/// Cloning is cheap (the bytes are reference counted) and never copies the
/// image, so readers can hold a frame while newer ones replace it in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    data: Bytes,
    captured_at_ms: i64,
}

impl Frame {
    /// Create a frame stamped with the current wall-clock time.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self::with_timestamp(data, chrono::Utc::now().timestamp_millis())
    }

    pub fn with_timestamp(data: impl Into<Bytes>, captured_at_ms: i64) -> Self {
        Self {
            data: data.into(),
            captured_at_ms,
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Unix millis at which the relay finished receiving this frame.
    pub fn captured_at_ms(&self) -> i64 {
        self.captured_at_ms
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns true if the payload starts with the JPEG SOI marker.
    pub fn looks_like_jpeg(&self) -> bool {
        self.data.starts_with(&JPEG_SOI)
    }

    /// Age of the frame relative to `now_ms`, clamped at zero.
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        (now_ms - self.captured_at_ms).max(0)
    }
}
