//! RTSP frame source.
//!
//! `RtspSource` ingests frames from IP cameras. `stub://` URIs get a
//! synthetic backend that serves deterministic pattern frames; `rtsp://`
//! URIs use a GStreamer pipeline (feature: rtsp-gstreamer).

use anyhow::{anyhow, Context, Result};
use std::time::Duration;
use url::Url;

use super::FrameSource;
use crate::frame::Frame;

const STUB_SCHEME: &str = "stub";
const DEFAULT_STUB_WIDTH: u32 = 640;
const DEFAULT_STUB_HEIGHT: u32 = 480;
/// Pacing for the synthetic backend, roughly a 25 fps camera.
const STUB_FRAME_PACE: Duration = Duration::from_millis(40);

/// One camera stream connection.
pub struct RtspSource {
    backend: RtspBackend,
}

enum RtspBackend {
    Synthetic(SyntheticSource),
    #[cfg(feature = "rtsp-gstreamer")]
    Gstreamer(GstreamerSource),
}

/// Check that a stream URI names a backend this build can serve.
pub(crate) fn check_scheme(stream_uri: &str) -> Result<()> {
    let url = Url::parse(stream_uri).with_context(|| format!("invalid stream uri {stream_uri}"))?;
    match url.scheme() {
        STUB_SCHEME => Ok(()),
        "rtsp" | "rtsps" => {
            if cfg!(feature = "rtsp-gstreamer") {
                Ok(())
            } else {
                Err(anyhow!(
                    "stream uri {} requires the rtsp-gstreamer feature",
                    stream_uri
                ))
            }
        }
        other => Err(anyhow!(
            "unsupported stream scheme '{}'; expected stub or rtsp(s)",
            other
        )),
    }
}

impl RtspSource {
    pub fn new(stream_uri: &str) -> Result<Self> {
        check_scheme(stream_uri)?;
        let url = Url::parse(stream_uri)
            .with_context(|| format!("invalid stream uri {stream_uri}"))?;
        let backend = if url.scheme() == STUB_SCHEME {
            RtspBackend::Synthetic(SyntheticSource::new(&url))
        } else {
            network_backend(stream_uri)?
        };
        Ok(Self { backend })
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn network_backend(stream_uri: &str) -> Result<RtspBackend> {
    Ok(RtspBackend::Gstreamer(GstreamerSource::new(stream_uri)?))
}

#[cfg(not(feature = "rtsp-gstreamer"))]
fn network_backend(stream_uri: &str) -> Result<RtspBackend> {
    // check_scheme already rejects network uris in stub-only builds.
    Err(anyhow!(
        "stream uri {} requires the rtsp-gstreamer feature",
        stream_uri
    ))
}

impl FrameSource for RtspSource {
    fn open(&mut self) -> Result<()> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.open(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.open(),
        }
    }

    fn close(&mut self) {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.close(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.close(),
        }
    }

    fn is_open(&self) -> bool {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.is_open(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.is_open(),
        }
    }

    fn read_frame(&mut self) -> Option<Frame> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.read_frame(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.read_frame(),
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests and bring-up
// ----------------------------------------------------------------------------

/// Serves deterministic pattern frames at a fixed pace. Dimensions can be
/// set via URI query params, e.g. `stub://lab?width=1440&height=1080`.
struct SyntheticSource {
    width: u32,
    height: u32,
    open: bool,
    frame_count: u64,
}

impl SyntheticSource {
    fn new(url: &Url) -> Self {
        let mut width = DEFAULT_STUB_WIDTH;
        let mut height = DEFAULT_STUB_HEIGHT;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "width" => {
                    if let Ok(parsed) = value.parse() {
                        width = parsed;
                    }
                }
                "height" => {
                    if let Ok(parsed) = value.parse() {
                        height = parsed;
                    }
                }
                _ => {}
            }
        }
        Self {
            width,
            height,
            open: false,
            frame_count: 0,
        }
    }

    fn open(&mut self) -> Result<()> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn read_frame(&mut self) -> Option<Frame> {
        if !self.open {
            return None;
        }
        std::thread::sleep(STUB_FRAME_PACE);
        self.frame_count += 1;
        let pixels = self.generate_pixels();
        Frame::new(pixels, self.width, self.height).ok()
    }

    /// A horizontal gradient that drifts with the frame counter, so
    /// consecutive frames differ without any randomness.
    fn generate_pixels(&self) -> Vec<u8> {
        let pixel_count = (self.width * self.height * 3) as usize;
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            let column = (i / 3) as u64 % self.width as u64;
            *pixel = ((column + self.frame_count) % 256) as u8;
        }
        pixels
    }
}

// ----------------------------------------------------------------------------
// Production RTSP source using GStreamer
// ----------------------------------------------------------------------------

#[cfg(feature = "rtsp-gstreamer")]
use gstreamer::prelude::*;

/// How long one read waits for a decoded sample before reporting an empty
/// stream.
#[cfg(feature = "rtsp-gstreamer")]
const READ_TIMEOUT_MS: u64 = 2_000;

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerSource {
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    playing: bool,
    last_error: Option<String>,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerSource {
    fn new(stream_uri: &str) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let pipeline_description = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            stream_uri
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build rtsp pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("rtsp pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        Ok(Self {
            pipeline,
            appsink,
            playing: false,
            last_error: None,
        })
    }

    fn open(&mut self) -> Result<()> {
        self.last_error = None;
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .context("set rtsp pipeline to Playing")?;
        self.playing = true;
        Ok(())
    }

    fn close(&mut self) {
        let _ = self.pipeline.set_state(gstreamer::State::Null);
        self.playing = false;
    }

    fn is_open(&self) -> bool {
        self.playing && self.last_error.is_none()
    }

    fn read_frame(&mut self) -> Option<Frame> {
        self.poll_bus();
        if !self.is_open() {
            return None;
        }
        let sample = self
            .appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(READ_TIMEOUT_MS))?;
        match sample_to_frame(&sample) {
            Ok(frame) => Some(frame),
            Err(e) => {
                log::warn!("rtsp sample decode failed: {}", e);
                None
            }
        }
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached EOS".to_string());
                }
                _ => {}
            }
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_frame(sample: &gstreamer::Sample) -> Result<Frame> {
    let buffer = sample.buffer().context("rtsp sample missing buffer")?;
    let caps = sample.caps().context("rtsp sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse rtsp caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = width as usize * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map rtsp buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Frame::new(data.to_vec(), width, height);
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("rtsp buffer row is out of bounds")?,
        );
    }

    Frame::new(pixels, width, height)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
