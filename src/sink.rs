//! Frame sinks.
//!
//! The consumer hands every decoded delivery to a [`FrameSink`]. A sink sees the metadata and,
//! when the envelope carried a decodable image, the frame itself.
//!
//! Built-in sinks:
//! - `log`: one log line per delivery
//! - `motion`: per-stream change detection between consecutive frames
//! - `snapshot:<dir>`: keeps the latest JPEG and metadata per stream on disk

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::envelope::EnvelopeMetadata;
use crate::frame::{Frame, DEFAULT_JPEG_QUALITY};

/// Downstream consumer of decoded frames.
pub trait FrameSink: Send {
    /// Identifier used in logs and errors.
    fn name(&self) -> &'static str;

    /// Whether deliveries without a usable image should still reach `consume`.
    fn accepts_metadata_only(&self) -> bool {
        true
    }

    /// Process one delivery. `frame` is `None` for metadata-only deliveries.
    fn consume(&mut self, frame: Option<&Frame>, meta: &EnvelopeMetadata) -> Result<()>;
}

impl<S: FrameSink + ?Sized> FrameSink for Box<S> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn accepts_metadata_only(&self) -> bool {
        (**self).accepts_metadata_only()
    }

    fn consume(&mut self, frame: Option<&Frame>, meta: &EnvelopeMetadata) -> Result<()> {
        (**self).consume(frame, meta)
    }
}

/// Which sink the consumer binary runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkKind {
    Log,
    Motion,
    Snapshot(PathBuf),
}

impl FromStr for SinkKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some(("snapshot", dir)) if !dir.is_empty() => Ok(Self::Snapshot(PathBuf::from(dir))),
            Some(("snapshot", _)) => Err(anyhow!("snapshot sink needs a directory: snapshot:<dir>")),
            _ => match s {
                "log" => Ok(Self::Log),
                "motion" => Ok(Self::Motion),
                other => Err(anyhow!(
                    "unknown sink '{}': expected 'log', 'motion' or 'snapshot:<dir>'",
                    other
                )),
            },
        }
    }
}

impl std::fmt::Display for SinkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Log => write!(f, "log"),
            Self::Motion => write!(f, "motion"),
            Self::Snapshot(dir) => write!(f, "snapshot:{}", dir.display()),
        }
    }
}

pub fn build_sink(kind: &SinkKind) -> Result<Box<dyn FrameSink>> {
    match kind {
        SinkKind::Log => Ok(Box::new(LogSink::default())),
        SinkKind::Motion => Ok(Box::new(MotionSink::default())),
        SinkKind::Snapshot(dir) => Ok(Box::new(SnapshotSink::new(dir)?)),
    }
}

/// Logs each delivery.
#[derive(Default)]
pub struct LogSink {
    frames: u64,
    metadata_only: u64,
}

impl LogSink {
    pub fn counts(&self) -> (u64, u64) {
        (self.frames, self.metadata_only)
    }
}

impl FrameSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    fn consume(&mut self, frame: Option<&Frame>, meta: &EnvelopeMetadata) -> Result<()> {
        match frame {
            Some(frame) => {
                self.frames += 1;
                log::info!("frame {} {}x{}", meta, frame.width, frame.height);
            }
            None => {
                self.metadata_only += 1;
                log::info!("metadata {}", meta);
            }
        }
        Ok(())
    }
}

/// Grid the motion sink downsamples to before comparing frames.
const MOTION_GRID: (u32, u32) = (32, 24);
/// Mean absolute luma difference (0-255) that counts as motion.
pub const DEFAULT_MOTION_THRESHOLD: f32 = 6.0;

struct StreamHistory {
    digest: [u8; 32],
    luma: Vec<u8>,
}

/// Result of comparing a frame with the previous frame of the same stream.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MotionReading {
    pub motion: bool,
    /// Mean absolute luma difference on the sampling grid.
    pub score: f32,
}

/// Flags change between consecutive frames of each stream.
///
/// Identical frames are caught by digest without sampling. The first frame of a stream only
/// primes the history.
pub struct MotionSink {
    threshold: f32,
    history: HashMap<String, StreamHistory>,
    last: HashMap<String, MotionReading>,
}

impl Default for MotionSink {
    fn default() -> Self {
        Self::new(DEFAULT_MOTION_THRESHOLD)
    }
}

impl MotionSink {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            history: HashMap::new(),
            last: HashMap::new(),
        }
    }

    pub fn last_reading(&self, stream_id: &str) -> Option<MotionReading> {
        self.last.get(stream_id).copied()
    }

    fn sample_luma(frame: &Frame) -> Vec<u8> {
        let (gw, gh) = MOTION_GRID;
        let mut luma = Vec::with_capacity((gw * gh) as usize);
        for gy in 0..gh {
            let y = (gy as u64 * frame.height as u64 / gh as u64) as u32;
            for gx in 0..gw {
                let x = (gx as u64 * frame.width as u64 / gw as u64) as u32;
                let [r, g, b] = frame.pixel(x, y).unwrap_or([0, 0, 0]);
                let y8 = (299 * r as u32 + 587 * g as u32 + 114 * b as u32) / 1000;
                luma.push(y8 as u8);
            }
        }
        luma
    }
}

impl FrameSink for MotionSink {
    fn name(&self) -> &'static str {
        "motion"
    }

    fn accepts_metadata_only(&self) -> bool {
        false
    }

    fn consume(&mut self, frame: Option<&Frame>, meta: &EnvelopeMetadata) -> Result<()> {
        let frame = frame.ok_or_else(|| anyhow!("motion sink needs image data"))?;
        let digest: [u8; 32] = Sha256::digest(frame.pixels()).into();
        let luma = Self::sample_luma(frame);

        let reading = match self.history.get(&meta.stream_id) {
            None => None,
            Some(prev) if prev.digest == digest => Some(MotionReading {
                motion: false,
                score: 0.0,
            }),
            Some(prev) => {
                let total: u64 = prev
                    .luma
                    .iter()
                    .zip(&luma)
                    .map(|(a, b)| a.abs_diff(*b) as u64)
                    .sum();
                let score = total as f32 / luma.len().max(1) as f32;
                Some(MotionReading {
                    motion: score >= self.threshold,
                    score,
                })
            }
        };

        if let Some(reading) = reading {
            if reading.motion {
                log::info!("motion {} score={:.1}", meta, reading.score);
            } else {
                log::debug!("no motion {} score={:.1}", meta, reading.score);
            }
            self.last.insert(meta.stream_id.clone(), reading);
        }
        self.history.insert(
            meta.stream_id.clone(),
            StreamHistory { digest, luma },
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct SnapshotRecord<'a> {
    timestamp: &'a str,
    stream_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<&'a str>,
    width: Option<u32>,
    height: Option<u32>,
}

/// Keeps `<stream>.jpg` and `<stream>.json` up to date in a directory. Files are replaced
/// atomically, so readers never see a partial write.
pub struct SnapshotSink {
    dir: PathBuf,
}

impl SnapshotSink {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create snapshot dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_stem(stream_id: &str) -> String {
        stream_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    fn replace(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let tmp = self.dir.join(format!(".{}.tmp", name));
        let dest = self.dir.join(name);
        std::fs::write(&tmp, bytes).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &dest).with_context(|| format!("rename to {}", dest.display()))?;
        Ok(())
    }
}

impl FrameSink for SnapshotSink {
    fn name(&self) -> &'static str {
        "snapshot"
    }

    fn consume(&mut self, frame: Option<&Frame>, meta: &EnvelopeMetadata) -> Result<()> {
        let stem = Self::file_stem(&meta.stream_id);
        if let Some(frame) = frame {
            let jpeg = frame.encode_jpeg(DEFAULT_JPEG_QUALITY)?;
            self.replace(&format!("{}.jpg", stem), &jpeg)?;
        }
        let record = SnapshotRecord {
            timestamp: &meta.timestamp,
            stream_id: &meta.stream_id,
            location: meta.location.as_deref(),
            width: frame.map(|f| f.width),
            height: frame.map(|f| f.height),
        };
        let json = serde_json::to_vec_pretty(&record)?;
        self.replace(&format!("{}.json", stem), &json)
    }
}
