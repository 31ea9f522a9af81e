//! Raw frames and their JPEG form.
//!
//! A `Frame` is an RGB8 raster. The publisher compresses it to JPEG before wrapping it in an
//! envelope; the consumer decompresses the payload back into a `Frame` for the sink.

use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageFormat, RgbImage};

use crate::error::{BridgeError, Result};

/// Upper bound on a compressed payload accepted for decoding.
pub const MAX_JPEG_BYTES: usize = 8 * 1024 * 1024;

pub const DEFAULT_JPEG_QUALITY: u8 = 80;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Packed RGB8, row-major, `width * height * 3` bytes.
    pixels: Vec<u8>,
}

impl Frame {
    pub fn from_rgb(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if width == 0 || height == 0 {
            return Err(BridgeError::FrameCapture(format!(
                "frame dimensions must be non-zero (got {}x{})",
                width, height
            )));
        }
        if pixels.len() != expected {
            return Err(BridgeError::FrameCapture(format!(
                "frame {}x{} needs {} bytes, got {}",
                width,
                height,
                expected,
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Solid colour frame.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Result<Self> {
        let pixels = rgb
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 3)
            .collect();
        Self::from_rgb(width, height, pixels)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = (y as usize * self.width as usize + x as usize) * 3;
        Some([self.pixels[idx], self.pixels[idx + 1], self.pixels[idx + 2]])
    }

    pub fn into_image(self) -> Option<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.pixels)
    }

    /// Compress to baseline JPEG. `quality` is clamped to 1..=100.
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.pixels.len() / 8);
        {
            let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
            encoder
                .encode(
                    &self.pixels,
                    self.width,
                    self.height,
                    ExtendedColorType::Rgb8,
                )
                .map_err(|e| BridgeError::FrameEncode(format!("jpeg encode: {}", e)))?;
        }
        Ok(out)
    }

    /// Decompress a JPEG payload. The error carries only the codec's reason; callers attach
    /// stream context.
    pub fn decode_jpeg(bytes: &[u8]) -> std::result::Result<Self, String> {
        if bytes.len() > MAX_JPEG_BYTES {
            return Err(format!(
                "payload of {} bytes exceeds {} byte limit",
                bytes.len(),
                MAX_JPEG_BYTES
            ));
        }
        let image = image::load_from_memory_with_format(bytes, ImageFormat::Jpeg)
            .map_err(|e| format!("jpeg decode: {}", e))?;
        let rgb = image.into_rgb8();
        let (width, height) = rgb.dimensions();
        Ok(Self {
            width,
            height,
            pixels: rgb.into_raw(),
        })
    }
}

impl From<RgbImage> for Frame {
    fn from(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            pixels: image.into_raw(),
        }
    }
}
