//! Decoded video frames.
//!
//! `Frame` is the unit handed from a stream source to the encoder: tightly
//! packed RGB8 pixels plus dimensions. Frames are transient - read from the
//! stream, encoded, dropped. Nothing in the crate retains them.

use anyhow::{anyhow, Result};

/// A decoded RGB8 frame. Pixels are tightly packed, row-major, 3 bytes per
/// pixel.
#[derive(Clone)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl Frame {
    /// Create a frame, checking that the pixel buffer matches the dimensions.
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(anyhow!(
                "frame buffer is {} bytes, expected {} for {}x{} rgb",
                data.len(),
                expected,
                width,
                height
            ));
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub(crate) fn into_parts(self) -> (Vec<u8>, u32, u32) {
        (self.data, self.width, self.height)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Keep pixel data out of log output.
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}
