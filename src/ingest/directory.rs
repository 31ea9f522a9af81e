//! Directory frame source.
//!
//! Replays the JPEG stills found in a local directory, in file name order, looping forever.
//! The listing is taken once at open time.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};

use super::{FrameSource, SourceStats};
use crate::frame::Frame;

pub struct DirectorySource {
    root: PathBuf,
    files: Vec<PathBuf>,
    cursor: usize,
    frame_count: u64,
}

impl DirectorySource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        let entries = std::fs::read_dir(&root)
            .with_context(|| format!("failed to read frame directory {}", root.display()))?;

        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && is_jpeg_path(&path) {
                files.push(path);
            }
        }
        files.sort();

        if files.is_empty() {
            return Err(anyhow!(
                "frame directory {} contains no .jpg/.jpeg files",
                root.display()
            ));
        }
        log::info!(
            "DirectorySource: {} ({} stills)",
            root.display(),
            files.len()
        );
        Ok(Self {
            root,
            files,
            cursor: 0,
            frame_count: 0,
        })
    }
}

impl FrameSource for DirectorySource {
    fn describe(&self) -> String {
        format!("{} ({} stills)", self.root.display(), self.files.len())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        let path = &self.files[self.cursor];
        self.cursor = (self.cursor + 1) % self.files.len();

        let bytes =
            std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let frame = Frame::decode_jpeg(&bytes)
            .map_err(|reason| anyhow!("{}: {}", path.display(), reason))?;
        self.frame_count += 1;
        Ok(frame)
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.root.display().to_string(),
        }
    }
}

fn is_jpeg_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
        .unwrap_or(false)
}
