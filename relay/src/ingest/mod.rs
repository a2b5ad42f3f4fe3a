//! Producer-facing adapters. Both decode their wire format into whole frames
//! and hand them to the shared [`FrameStore`](crate::store::FrameStore).

pub mod multipart;
pub mod websocket;
