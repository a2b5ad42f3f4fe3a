use std::sync::RwLock;

use bytes::Bytes;
use frame_relay_common::frame::Frame;
use tracing::debug;

/// The latest frame together with the version it was stored under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub frame: Frame,
    pub version: u64,
}

/// Single shared slot holding the most recent frame.
///
/// Created once at startup and handed to every ingest and delivery adapter.
/// The frame and its version live behind one lock so a reader always sees a
/// matching pair. Writers replace the slot; nothing is ever queued, and each
/// `set` supersedes the previous frame (last writer wins).
///
/// Version 0 means no frame has been stored yet; the first frame gets 1 and
/// every accepted `set` adds exactly 1.
#[derive(Debug, Default)]
pub struct FrameStore {
    slot: RwLock<Option<Snapshot>>,
}

impl FrameStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `data` as the current frame and return its version.
    ///
    /// Empty payloads are ignored and return `None`.
    pub fn set(&self, data: impl Into<Bytes>) -> Option<u64> {
        let data = data.into();
        if data.is_empty() {
            return None;
        }
        let frame = Frame::new(data);
        if !frame.looks_like_jpeg() {
            debug!(bytes = frame.len(), "storing frame without JPEG marker");
        }

        // The guarded value is always a complete snapshot, so a poisoned lock
        // still holds valid data.
        let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
        let version = slot.as_ref().map_or(1, |s| s.version + 1);
        *slot = Some(Snapshot { frame, version });
        Some(version)
    }

    /// The current frame and its version, or `None` before the first frame.
    pub fn get(&self) -> Option<Snapshot> {
        self.slot.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn version(&self) -> u64 {
        self.slot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(0, |s| s.version)
    }
}
