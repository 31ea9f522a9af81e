//! Frame sources for the publisher.
//!
//! This module provides the sources a publisher can pull frames from:
//! - Synthetic generator (`stub://` URIs) for demos and tests
//! - Directory of still JPEG images, replayed in a loop
//!
//! A capture device proper is an external collaborator; anything that can hand over an RGB
//! raster implements [`FrameSource`] and plugs into the publisher the same way.

pub mod directory;
pub mod synthetic;

use anyhow::Result;

use crate::frame::Frame;

pub use directory::DirectorySource;
pub use synthetic::SyntheticSource;

/// Something that produces frames on demand.
pub trait FrameSource: Send {
    /// Human readable identity for log lines.
    fn describe(&self) -> String;

    /// Capture the next frame. Errors are treated as transient by the publisher.
    fn next_frame(&mut self) -> Result<Frame>;

    fn stats(&self) -> SourceStats;
}

/// Statistics for a frame source.
#[derive(Clone, Debug)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub source: String,
}

/// Configuration for opening a frame source.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    /// `stub://<name>` for the synthetic generator; `dir://<path>` or a bare path for a
    /// directory of stills.
    pub uri: String,
    /// Raster size for the synthetic generator.
    pub width: u32,
    pub height: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            uri: "stub://edge_camera".to_string(),
            width: 640,
            height: 480,
        }
    }
}

pub fn open_source(config: &SourceConfig) -> Result<Box<dyn FrameSource>> {
    if config.uri.starts_with("stub://") {
        Ok(Box::new(SyntheticSource::new(
            &config.uri,
            config.width,
            config.height,
        )?))
    } else {
        let path = config.uri.strip_prefix("dir://").unwrap_or(&config.uri);
        Ok(Box::new(DirectorySource::open(path)?))
    }
}
