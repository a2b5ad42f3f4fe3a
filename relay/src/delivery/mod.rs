//! Viewer-facing adapters reading the shared [`FrameStore`](crate::store::FrameStore).

pub mod mjpeg;
pub mod snapshot;
