//! Sampled-frame encoding.
//!
//! Frames wider than [`MAX_FRAME_WIDTH`] are downscaled preserving aspect
//! ratio, with both output dimensions rounded up to the nearest even
//! integer (downstream video encoders reject odd sizes). The result is
//! JPEG-encoded and wrapped in base64 for the JSON wire message.

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::RgbImage;

use crate::frame::Frame;

/// Widest frame the relay will put on the wire.
pub const MAX_FRAME_WIDTH: u32 = 720;

const JPEG_QUALITY: u8 = 80;

/// Output dimensions for a frame, applying the max-width downscale rule.
pub fn scaled_dimensions(width: u32, height: u32) -> (u32, u32) {
    if width <= MAX_FRAME_WIDTH {
        return (width, height);
    }
    let factor = MAX_FRAME_WIDTH as f64 / width as f64;
    (
        round_up_to_even(width as f64 * factor),
        round_up_to_even(height as f64 * factor),
    )
}

fn round_up_to_even(scaled: f64) -> u32 {
    let truncated = scaled as u32;
    if truncated % 2 != 0 {
        truncated + 1
    } else {
        truncated
    }
}

/// Encode a frame as a base64 JPEG payload, downscaling if it exceeds
/// [`MAX_FRAME_WIDTH`].
pub fn encode_frame(frame: Frame) -> Result<String> {
    let (data, width, height) = frame.into_parts();
    let image = RgbImage::from_raw(width, height, data)
        .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", width, height))?;

    let (out_width, out_height) = scaled_dimensions(width, height);
    let image = if (out_width, out_height) != (width, height) {
        image::imageops::resize(&image, out_width, out_height, FilterType::Triangle)
    } else {
        image
    };

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY)
        .encode_image(&image)
        .context("jpeg encode")?;
    Ok(base64::engine::general_purpose::STANDARD.encode(jpeg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    fn solid_frame(width: u32, height: u32) -> Frame {
        Frame::new(vec![128u8; (width * height * 3) as usize], width, height).expect("frame")
    }

    #[test]
    fn wide_frames_scale_to_720() {
        assert_eq!(scaled_dimensions(1440, 1080), (720, 540));
    }

    #[test]
    fn narrow_frames_pass_through() {
        assert_eq!(scaled_dimensions(720, 576), (720, 576));
        assert_eq!(scaled_dimensions(320, 240), (320, 240));
    }

    #[test]
    fn scaled_dimensions_are_even_and_bounded() {
        for (width, height) in [(1442, 1081), (1920, 1079), (1000, 751), (721, 577)] {
            let (out_width, out_height) = scaled_dimensions(width, height);
            assert!(
                out_width <= MAX_FRAME_WIDTH,
                "{}x{} scaled to width {}",
                width,
                height,
                out_width
            );
            assert_eq!(out_width % 2, 0);
            assert_eq!(out_height % 2, 0);
        }
    }

    #[test]
    fn encode_downscales_wide_frames() {
        let encoded = encode_frame(solid_frame(1440, 1080)).expect("encode");
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .expect("base64");
        assert_eq!(&bytes[..2], &[0xFF, 0xD8], "payload is not jpeg");
        let decoded = image::load_from_memory(&bytes).expect("decode jpeg");
        assert_eq!((decoded.width(), decoded.height()), (720, 540));
    }

    #[test]
    fn encode_keeps_small_frames_unchanged() {
        let encoded = encode_frame(solid_frame(640, 480)).expect("encode");
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .expect("base64");
        let decoded = image::load_from_memory(&bytes).expect("decode jpeg");
        assert_eq!((decoded.width(), decoded.height()), (640, 480));
    }
}
