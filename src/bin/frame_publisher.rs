//! frame_publisher - capture frames and publish them to the broker at a fixed rate.
//!
//! Runs until interrupted. Configuration comes from `FRAME_BRIDGE_CONFIG`, then
//! `FRAME_BRIDGE_*` variables, then the flags below.

use anyhow::{Context, Result};
use clap::Parser;

use frame_bridge::config::{BridgeConfig, BrokerArgs};
use frame_bridge::{open_source, FramePublisher, MqttBroker, Shutdown};

const COMPONENT: &str = "frame_publisher";

#[derive(Parser, Debug)]
#[command(author, version, about = "Publish camera frames to a broker queue")]
struct Args {
    #[command(flatten)]
    broker: BrokerArgs,

    /// Stream identifier stamped on every envelope.
    #[arg(long, env = "FRAME_BRIDGE_STREAM_ID")]
    stream_id: Option<String>,

    /// Free-form location label.
    #[arg(long, env = "FRAME_BRIDGE_LOCATION")]
    location: Option<String>,

    /// Frames per second.
    #[arg(long, env = "FRAME_BRIDGE_FPS")]
    fps: Option<f64>,

    /// Synthetic frame width.
    #[arg(long)]
    width: Option<u32>,

    /// Synthetic frame height.
    #[arg(long)]
    height: Option<u32>,

    /// JPEG quality (1-100).
    #[arg(long)]
    jpeg_quality: Option<u8>,

    /// Replay JPEG stills from this directory instead of the synthetic source.
    #[arg(long, env = "FRAME_BRIDGE_SOURCE_DIR")]
    source_dir: Option<String>,
}

impl Args {
    fn apply(&self, cfg: &mut BridgeConfig) {
        self.broker.apply(cfg);
        if let Some(stream_id) = &self.stream_id {
            cfg.publisher.stream_id = stream_id.clone();
        }
        if let Some(location) = &self.location {
            cfg.publisher.location = Some(location.clone()).filter(|l| !l.trim().is_empty());
        }
        if let Some(fps) = self.fps {
            cfg.publisher.fps = fps;
        }
        if let Some(width) = self.width {
            cfg.publisher.source.width = width;
        }
        if let Some(height) = self.height {
            cfg.publisher.source.height = height;
        }
        if let Some(quality) = self.jpeg_quality {
            cfg.publisher.jpeg_quality = quality;
        }
        if let Some(dir) = &self.source_dir {
            cfg.publisher.source.uri = dir.clone();
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = BridgeConfig::load_layers()?;
    args.apply(&mut cfg);
    cfg.validate()?;

    let shutdown = Shutdown::new();
    shutdown.install_ctrlc(COMPONENT)?;

    let source = open_source(&cfg.publisher.source).context("failed to open frame source")?;
    let broker = MqttBroker::connect(&cfg.publisher_broker_settings())?;
    let publisher = FramePublisher::new(source, cfg.publisher_settings(), broker)?;

    let report = publisher.run(&shutdown)?;
    log::info!(
        "{}: shutdown complete (published={} capture_failures={} encode_failures={})",
        COMPONENT,
        report.frames_published,
        report.capture_failures,
        report.encode_failures
    );
    Ok(())
}
