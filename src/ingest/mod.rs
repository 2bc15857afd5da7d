//! Frame ingestion sources.
//!
//! A `FrameSource` owns one camera's stream connection and yields decoded
//! frames. Two backends are provided:
//! - `stub://` synthetic frames, always available (tests, bring-up)
//! - RTSP via GStreamer (feature: rtsp-gstreamer)
//!
//! Workers acquire sources through a [`SourceFactory`] so that replacing a
//! wedged connection is ordinary re-construction rather than in-place
//! repair.

use anyhow::Result;

use crate::frame::Frame;

pub mod rtsp;

pub use rtsp::RtspSource;

/// A connection to one camera stream. Owned exclusively by its worker;
/// implementations do not need to be thread-safe beyond `Send`.
pub trait FrameSource: Send {
    /// Open (or reopen) the connection.
    fn open(&mut self) -> Result<()>;

    /// Close the connection. Safe to call repeatedly.
    fn close(&mut self);

    /// Whether the connection currently reports itself usable.
    fn is_open(&self) -> bool;

    /// Read the next decoded frame, or `None` if the stream has nothing to
    /// yield within the source's own read timeout.
    fn read_frame(&mut self) -> Option<Frame>;
}

/// Builds a fresh source against a fixed stream URI. Invoked once at worker
/// construction and again whenever a reconnect episode exhausts its polls.
pub type SourceFactory = Box<dyn Fn() -> Result<Box<dyn FrameSource>> + Send>;

/// Validate `stream_uri` and return a factory producing sources for it.
///
/// Scheme problems surface here, before any worker is spawned, instead of
/// inside a running reconnect loop.
pub fn source_factory(stream_uri: &str) -> Result<SourceFactory> {
    rtsp::check_scheme(stream_uri)?;
    let uri = stream_uri.to_string();
    Ok(Box::new(move || {
        Ok(Box::new(RtspSource::new(&uri)?) as Box<dyn FrameSource>)
    }))
}
