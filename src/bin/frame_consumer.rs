//! frame_consumer - receive frames from the broker queue and hand them to a sink.
//!
//! Runs until interrupted. Configuration comes from `FRAME_BRIDGE_CONFIG`, then
//! `FRAME_BRIDGE_*` variables, then the flags below.

use anyhow::Result;
use clap::Parser;

use frame_bridge::config::{BridgeConfig, BrokerArgs};
use frame_bridge::{
    build_sink, AckMode, FrameConsumer, MqttBroker, Resolution, Shutdown, ShutdownPolicy, SinkKind,
};

const COMPONENT: &str = "frame_consumer";

#[derive(Parser, Debug)]
#[command(author, version, about = "Consume camera frames from a broker queue")]
struct Args {
    #[command(flatten)]
    broker: BrokerArgs,

    /// Maximum deliveries in flight.
    #[arg(long, env = "FRAME_BRIDGE_PREFETCH")]
    prefetch: Option<u16>,

    /// auto: settled on receipt. manual: settled after the sink succeeds.
    #[arg(long, env = "FRAME_BRIDGE_ACK_MODE")]
    ack_mode: Option<AckMode>,

    /// Worker threads calling the sink.
    #[arg(long, env = "FRAME_BRIDGE_WORKERS")]
    workers: Option<usize>,

    /// log | motion | snapshot:<dir>
    #[arg(long, env = "FRAME_BRIDGE_SINK")]
    sink: Option<SinkKind>,

    /// Resolution for envelopes that fail to decode (ack|reject).
    #[arg(long)]
    on_decode_failure: Option<Resolution>,

    /// Resolution for deliveries the sink fails on (ack|reject).
    #[arg(long)]
    on_sink_failure: Option<Resolution>,

    /// Queued deliveries at shutdown: drain (process) or discard (reject).
    #[arg(long)]
    shutdown: Option<ShutdownPolicy>,

    /// Shared subscription group; consumers in one group split the queue. Empty for a plain
    /// subscription.
    #[arg(long, env = "FRAME_BRIDGE_SHARE_GROUP")]
    share_group: Option<String>,
}

impl Args {
    fn apply(&self, cfg: &mut BridgeConfig) {
        self.broker.apply(cfg);
        if let Some(prefetch) = self.prefetch {
            cfg.consumer.prefetch = prefetch;
        }
        if let Some(mode) = self.ack_mode {
            cfg.consumer.ack_mode = mode;
        }
        if let Some(workers) = self.workers {
            cfg.consumer.workers = workers;
        }
        if let Some(sink) = &self.sink {
            cfg.consumer.sink = sink.clone();
        }
        if let Some(resolution) = self.on_decode_failure {
            cfg.consumer.on_decode_failure = resolution;
        }
        if let Some(resolution) = self.on_sink_failure {
            cfg.consumer.on_sink_failure = resolution;
        }
        if let Some(policy) = self.shutdown {
            cfg.consumer.shutdown = policy;
        }
        if let Some(group) = &self.share_group {
            cfg.consumer.share_group = Some(group.clone()).filter(|g| !g.is_empty());
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

    let sink = build_sink(&cfg.consumer.sink)?;
    log::info!("{}: sink={}", COMPONENT, cfg.consumer.sink);
    let consumer = FrameConsumer::new(cfg.consumer_settings(), sink)?;
    let broker = MqttBroker::connect(&cfg.consumer_broker_settings())?;

    let report = consumer.run(broker, &shutdown)?;
    log::info!(
        "{}: shutdown complete (received={} dispatched={} decode_failures={} image_failures={} sink_failures={})",
        COMPONENT,
        report.received,
        report.dispatched,
        report.decode_failures,
        report.image_failures,
        report.sink_failures
    );
    Ok(())
}
