//! Synthetic frame source (`stub://`).
//!
//! Produces a dark canvas with a filled rectangle whose colour cycles with wall-clock time, so
//! consecutive frames differ and a consumer can see the stream is live.
//! No caption text is drawn; the raster carries only the rectangle.

use anyhow::{anyhow, Result};
use std::time::{SystemTime, UNIX_EPOCH};

use super::{FrameSource, SourceStats};
use crate::frame::Frame;

/// Reference canvas the rectangle geometry is defined against.
const REFERENCE_WIDTH: u32 = 640;
const REFERENCE_HEIGHT: u32 = 480;
const RECT: (u32, u32, u32, u32) = (100, 100, 540, 380);

pub struct SyntheticSource {
    uri: String,
    width: u32,
    height: u32,
    frame_count: u64,
}

impl SyntheticSource {
    pub fn new(uri: &str, width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!(
                "synthetic source needs non-zero dimensions (got {}x{})",
                width,
                height
            ));
        }
        log::info!("SyntheticSource: {} ({}x{})", uri, width, height);
        Ok(Self {
            uri: uri.to_string(),
            width,
            height,
            frame_count: 0,
        })
    }

    /// Render one frame for the given colour phase (0..=254).
    pub fn render(&self, phase: u8) -> Result<Frame> {
        let (x0, y0, x1, y1) = self.scaled_rect();
        let fill = [128, 255 - phase, phase];
        let mut pixels = vec![0u8; self.width as usize * self.height as usize * 3];
        for y in y0..y1 {
            let row = y as usize * self.width as usize;
            for x in x0..x1 {
                let idx = (row + x as usize) * 3;
                pixels[idx..idx + 3].copy_from_slice(&fill);
            }
        }
        Ok(Frame::from_rgb(self.width, self.height, pixels)?)
    }

    fn scaled_rect(&self) -> (u32, u32, u32, u32) {
        let sx = |v: u32| (v as u64 * self.width as u64 / REFERENCE_WIDTH as u64) as u32;
        let sy = |v: u32| (v as u64 * self.height as u64 / REFERENCE_HEIGHT as u64) as u32;
        (sx(RECT.0), sy(RECT.1), sx(RECT.2), sy(RECT.3))
    }
}

impl FrameSource for SyntheticSource {
    fn describe(&self) -> String {
        format!("{} ({}x{} synthetic)", self.uri, self.width, self.height)
    }

    fn next_frame(&mut self) -> Result<Frame> {
        let centis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() / 10)
            .unwrap_or(0);
        let frame = self.render((centis % 255) as u8)?;
        self.frame_count += 1;
        Ok(frame)
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.uri.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rectangle_is_drawn_on_black() {
        let source = SyntheticSource::new("stub://t", 640, 480).unwrap();
        let frame = source.render(10).unwrap();
        assert_eq!(frame.pixel(0, 0), Some([0, 0, 0]));
        assert_eq!(frame.pixel(320, 240), Some([128, 245, 10]));
        assert_eq!(frame.pixel(539, 379), Some([128, 245, 10]));
        assert_eq!(frame.pixel(540, 380), Some([0, 0, 0]));
    }

    #[test]
    fn geometry_scales_with_size() {
        let source = SyntheticSource::new("stub://t", 64, 48).unwrap();
        let frame = source.render(0).unwrap();
        assert_eq!(frame.pixel(5, 5), Some([0, 0, 0]));
        assert_eq!(frame.pixel(32, 24), Some([128, 255, 0]));
    }

    #[test]
    fn zero_size_is_rejected() {
        assert!(SyntheticSource::new("stub://t", 0, 10).is_err());
    }
}
