use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::consumer::{ConsumerSettings, Resolution, ShutdownPolicy};
use crate::frame::DEFAULT_JPEG_QUALITY;
use crate::ingest::SourceConfig;
use crate::publisher::PublisherSettings;
use crate::sink::SinkKind;
use crate::transport::mqtt::validate_share_group;
use crate::transport::{parse_broker_endpoint, AckMode, BrokerSettings};

pub const CONFIG_ENV: &str = "FRAME_BRIDGE_CONFIG";

const DEFAULT_BROKER_ADDR: &str = "127.0.0.1:1883";
const DEFAULT_QUEUE: &str = "edge_frames";
const DEFAULT_STREAM_ID: &str = "camera-stream-001";
const DEFAULT_LOCATION: &str = "edge-location-bldg4-floor2";
const DEFAULT_SOURCE: &str = "stub://edge_camera";
const DEFAULT_FPS: f64 = 1.0;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_KEEP_ALIVE_SECS: u64 = 30;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_SESSION_EXPIRY_SECS: u32 = 3600;
const DEFAULT_POLL_INTERVAL_MS: u64 = 200;
const DEFAULT_SHARE_GROUP: &str = "frame-consumers";

#[derive(Debug, Deserialize, Default)]
struct BridgeConfigFile {
    queue: Option<String>,
    broker: Option<BrokerConfigFile>,
    publisher: Option<PublisherConfigFile>,
    consumer: Option<ConsumerConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct BrokerConfigFile {
    addr: Option<String>,
    use_tls: Option<bool>,
    ca_path: Option<PathBuf>,
    client_cert_path: Option<PathBuf>,
    client_key_path: Option<PathBuf>,
    username: Option<String>,
    password: Option<String>,
    client_id: Option<String>,
    keep_alive_secs: Option<u64>,
    connect_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct PublisherConfigFile {
    stream_id: Option<String>,
    location: Option<String>,
    fps: Option<f64>,
    jpeg_quality: Option<u8>,
    source: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ConsumerConfigFile {
    prefetch: Option<u16>,
    ack_mode: Option<String>,
    workers: Option<usize>,
    on_decode_failure: Option<String>,
    on_sink_failure: Option<String>,
    shutdown: Option<String>,
    poll_interval_ms: Option<u64>,
    session_expiry_secs: Option<u32>,
    share_group: Option<String>,
    sink: Option<String>,
}

/// Broker connection section, shared by both binaries.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub addr: String,
    pub use_tls: bool,
    pub ca_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// When unset each side derives its own client id.
    pub client_id: Option<String>,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub stream_id: String,
    pub location: Option<String>,
    pub fps: f64,
    pub jpeg_quality: u8,
    pub source: SourceConfig,
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub prefetch: u16,
    pub ack_mode: AckMode,
    pub workers: usize,
    pub on_decode_failure: Resolution,
    pub on_sink_failure: Resolution,
    pub shutdown: ShutdownPolicy,
    pub poll_interval: Duration,
    pub session_expiry_secs: u32,
    /// Shared subscription group; consumers in one group split the queue. `None` (an empty
    /// string in files and env) subscribes to the plain topic and every consumer sees every
    /// frame.
    pub share_group: Option<String>,
    pub sink: SinkKind,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub queue: String,
    pub broker: BrokerConfig,
    pub publisher: PublisherConfig,
    pub consumer: ConsumerConfig,
}

impl BridgeConfig {
    /// Defaults, then the file named by `FRAME_BRIDGE_CONFIG`, then `FRAME_BRIDGE_*`
    /// environment variables. The result is validated.
    pub fn load() -> Result<Self> {
        let cfg = Self::load_layers()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Same layering as [`BridgeConfig::load`] without the final `validate`, for callers that
    /// apply further overrides (CLI flags) first. Malformed values still fail here.
    pub fn load_layers() -> Result<Self> {
        let file_cfg = match std::env::var(CONFIG_ENV).ok() {
            Some(path) if !path.trim().is_empty() => read_config_file(Path::new(&path))?,
            _ => BridgeConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        Ok(cfg)
    }

    fn from_file(file: BridgeConfigFile) -> Result<Self> {
        let broker = file.broker.unwrap_or_default();
        let publisher = file.publisher.unwrap_or_default();
        let consumer = file.consumer.unwrap_or_default();

        let broker = BrokerConfig {
            addr: broker
                .addr
                .unwrap_or_else(|| DEFAULT_BROKER_ADDR.to_string()),
            use_tls: broker.use_tls.unwrap_or(false),
            ca_path: broker.ca_path,
            client_cert_path: broker.client_cert_path,
            client_key_path: broker.client_key_path,
            username: broker.username,
            password: broker.password,
            client_id: broker.client_id,
            keep_alive: Duration::from_secs(
                broker.keep_alive_secs.unwrap_or(DEFAULT_KEEP_ALIVE_SECS),
            ),
            connect_timeout: Duration::from_secs(
                broker
                    .connect_timeout_secs
                    .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
            ),
        };

        let publisher = PublisherConfig {
            stream_id: publisher
                .stream_id
                .unwrap_or_else(|| DEFAULT_STREAM_ID.to_string()),
            location: match publisher.location {
                Some(location) => non_empty(location),
                None => Some(DEFAULT_LOCATION.to_string()),
            },
            fps: publisher.fps.unwrap_or(DEFAULT_FPS),
            jpeg_quality: publisher.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            source: SourceConfig {
                uri: publisher
                    .source
                    .unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
                width: publisher.width.unwrap_or(DEFAULT_WIDTH),
                height: publisher.height.unwrap_or(DEFAULT_HEIGHT),
            },
        };

        let consumer = ConsumerConfig {
            prefetch: consumer.prefetch.unwrap_or(1),
            ack_mode: parse_opt(consumer.ack_mode, "consumer.ack_mode")?.unwrap_or_default(),
            workers: consumer.workers.unwrap_or(1),
            on_decode_failure: parse_opt(consumer.on_decode_failure, "consumer.on_decode_failure")?
                .unwrap_or(Resolution::Ack),
            on_sink_failure: parse_opt(consumer.on_sink_failure, "consumer.on_sink_failure")?
                .unwrap_or(Resolution::Ack),
            shutdown: parse_opt(consumer.shutdown, "consumer.shutdown")?.unwrap_or_default(),
            poll_interval: Duration::from_millis(
                consumer.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            session_expiry_secs: consumer
                .session_expiry_secs
                .unwrap_or(DEFAULT_SESSION_EXPIRY_SECS),
            share_group: match consumer.share_group {
                Some(group) => non_empty(group),
                None => Some(DEFAULT_SHARE_GROUP.to_string()),
            },
            sink: parse_opt(consumer.sink, "consumer.sink")?.unwrap_or(SinkKind::Log),
        };

        Ok(Self {
            queue: file.queue.unwrap_or_else(|| DEFAULT_QUEUE.to_string()),
            broker,
            publisher,
            consumer,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = env_value("FRAME_BRIDGE_BROKER_ADDR") {
            self.broker.addr = addr;
        }
        if let Some(tls) = env_value("FRAME_BRIDGE_BROKER_TLS") {
            self.broker.use_tls = parse_bool(&tls)
                .ok_or_else(|| anyhow!("FRAME_BRIDGE_BROKER_TLS must be true or false"))?;
        }
        if let Some(user) = env_value("FRAME_BRIDGE_BROKER_USERNAME") {
            self.broker.username = Some(user);
        }
        if let Some(password) = env_value("FRAME_BRIDGE_BROKER_PASSWORD") {
            self.broker.password = Some(password);
        }
        if let Some(queue) = env_value("FRAME_BRIDGE_QUEUE") {
            self.queue = queue;
        }
        if let Some(stream_id) = env_value("FRAME_BRIDGE_STREAM_ID") {
            self.publisher.stream_id = stream_id;
        }
        if let Ok(location) = std::env::var("FRAME_BRIDGE_LOCATION") {
            self.publisher.location = non_empty(location);
        }
        if let Some(source) = env_value("FRAME_BRIDGE_SOURCE") {
            self.publisher.source.uri = source;
        }
        if let Some(fps) = env_value("FRAME_BRIDGE_FPS") {
            self.publisher.fps = fps
                .parse()
                .map_err(|_| anyhow!("FRAME_BRIDGE_FPS must be a number"))?;
        }
        if let Some(prefetch) = env_value("FRAME_BRIDGE_PREFETCH") {
            self.consumer.prefetch = prefetch
                .parse()
                .map_err(|_| anyhow!("FRAME_BRIDGE_PREFETCH must be a positive integer"))?;
        }
        if let Some(mode) = env_value("FRAME_BRIDGE_ACK_MODE") {
            self.consumer.ack_mode = mode.parse().context("FRAME_BRIDGE_ACK_MODE")?;
        }
        if let Some(workers) = env_value("FRAME_BRIDGE_WORKERS") {
            self.consumer.workers = workers
                .parse()
                .map_err(|_| anyhow!("FRAME_BRIDGE_WORKERS must be a positive integer"))?;
        }
        if let Ok(group) = std::env::var("FRAME_BRIDGE_SHARE_GROUP") {
            self.consumer.share_group = non_empty(group);
        }
        if let Some(sink) = env_value("FRAME_BRIDGE_SINK") {
            self.consumer.sink = sink.parse().context("FRAME_BRIDGE_SINK")?;
        }
        Ok(())
    }

    /// Checks everything that can be checked without touching the network.
    pub fn validate(&self) -> Result<()> {
        parse_broker_endpoint(&self.broker.addr, self.broker.use_tls)?;
        if self.broker.connect_timeout.is_zero() {
            return Err(anyhow!("broker.connect_timeout_secs must be greater than zero"));
        }
        self.publisher_settings().validate()?;
        if self.publisher.source.width == 0 || self.publisher.source.height == 0 {
            return Err(anyhow!("publisher width and height must be greater than zero"));
        }
        self.consumer_settings().validate()?;
        if let Some(group) = &self.consumer.share_group {
            validate_share_group(group)?;
        }
        Ok(())
    }

    pub fn publisher_settings(&self) -> PublisherSettings {
        PublisherSettings {
            queue: self.queue.clone(),
            stream_id: self.publisher.stream_id.clone(),
            location: self.publisher.location.clone(),
            fps: self.publisher.fps,
            jpeg_quality: self.publisher.jpeg_quality,
        }
    }

    pub fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            queue: self.queue.clone(),
            prefetch: self.consumer.prefetch,
            ack_mode: self.consumer.ack_mode,
            workers: self.consumer.workers,
            on_decode_failure: self.consumer.on_decode_failure,
            on_sink_failure: self.consumer.on_sink_failure,
            shutdown: self.consumer.shutdown,
            poll_interval: self.consumer.poll_interval,
        }
    }

    /// Connection settings for the publishing side. Publishers start a clean session.
    pub fn publisher_broker_settings(&self) -> BrokerSettings {
        let client_id = self
            .broker
            .client_id
            .clone()
            .unwrap_or_else(|| format!("frame-publisher-{}", std::process::id()));
        self.broker_settings(client_id, None)
    }

    /// Connection settings for the consuming side. The client id is stable per queue and the
    /// session outlives disconnects, so frames published meanwhile are kept for it. Prefetch
    /// becomes the connection's receive maximum.
    pub fn consumer_broker_settings(&self) -> BrokerSettings {
        let client_id = self
            .broker
            .client_id
            .clone()
            .unwrap_or_else(|| format!("frame-consumer-{}", self.queue.replace('/', "-")));
        BrokerSettings {
            receive_maximum: Some(self.consumer.prefetch),
            share_group: self.consumer.share_group.clone(),
            ..self.broker_settings(client_id, Some(self.consumer.session_expiry_secs))
        }
    }

    fn broker_settings(&self, client_id: String, session_expiry_secs: Option<u32>) -> BrokerSettings {
        BrokerSettings {
            addr: self.broker.addr.clone(),
            use_tls: self.broker.use_tls,
            ca_path: self.broker.ca_path.clone(),
            client_cert_path: self.broker.client_cert_path.clone(),
            client_key_path: self.broker.client_key_path.clone(),
            username: self.broker.username.clone(),
            password: self.broker.password.clone(),
            client_id,
            keep_alive: self.broker.keep_alive,
            connect_timeout: self.broker.connect_timeout,
            session_expiry_secs,
            receive_maximum: None,
            share_group: None,
        }
    }
}

/// Broker flags shared by both binaries. Each one overrides the loaded configuration.
#[derive(clap::Args, Debug, Default)]
pub struct BrokerArgs {
    /// Broker address (host:port, mqtt://, mqtts://).
    #[arg(long, env = "FRAME_BRIDGE_BROKER_ADDR")]
    pub broker_addr: Option<String>,

    /// Queue shared by publisher and consumer.
    #[arg(long, env = "FRAME_BRIDGE_QUEUE")]
    pub queue: Option<String>,

    /// Broker username.
    #[arg(long, env = "FRAME_BRIDGE_BROKER_USERNAME")]
    pub broker_username: Option<String>,

    /// Broker password.
    #[arg(long, env = "FRAME_BRIDGE_BROKER_PASSWORD")]
    pub broker_password: Option<String>,

    /// Enable TLS (implied by mqtts:// addresses).
    #[arg(long)]
    pub broker_tls: bool,

    /// PEM CA certificate to trust.
    #[arg(long, env = "FRAME_BRIDGE_BROKER_CA_PATH")]
    pub broker_ca_path: Option<PathBuf>,

    /// PEM client certificate for mutual TLS.
    #[arg(long, env = "FRAME_BRIDGE_BROKER_CLIENT_CERT_PATH")]
    pub broker_client_cert_path: Option<PathBuf>,

    /// PEM client key for mutual TLS.
    #[arg(long, env = "FRAME_BRIDGE_BROKER_CLIENT_KEY_PATH")]
    pub broker_client_key_path: Option<PathBuf>,

    /// MQTT client identifier.
    #[arg(long, env = "FRAME_BRIDGE_CLIENT_ID")]
    pub client_id: Option<String>,
}

impl BrokerArgs {
    pub fn apply(&self, cfg: &mut BridgeConfig) {
        if let Some(addr) = &self.broker_addr {
            cfg.broker.addr = addr.clone();
        }
        if let Some(queue) = &self.queue {
            cfg.queue = queue.clone();
        }
        if let Some(user) = &self.broker_username {
            cfg.broker.username = Some(user.clone());
        }
        if let Some(password) = &self.broker_password {
            cfg.broker.password = Some(password.clone());
        }
        if self.broker_tls {
            cfg.broker.use_tls = true;
        }
        if let Some(path) = &self.broker_ca_path {
            cfg.broker.ca_path = Some(path.clone());
        }
        if let Some(path) = &self.broker_client_cert_path {
            cfg.broker.client_cert_path = Some(path.clone());
        }
        if let Some(path) = &self.broker_client_key_path {
            cfg.broker.client_key_path = Some(path.clone());
        }
        if let Some(id) = &self.client_id {
            cfg.broker.client_id = Some(id.clone());
        }
    }
}

fn read_config_file(path: &Path) -> Result<BridgeConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn parse_opt<T>(value: Option<String>, field: &str) -> Result<Option<T>>
where
    T: std::str::FromStr<Err = anyhow::Error>,
{
    value
        .map(|raw| raw.parse::<T>().with_context(|| format!("invalid {}", field)))
        .transpose()
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> BridgeConfig {
        BridgeConfig::from_file(BridgeConfigFile::default()).unwrap()
    }

    #[test]
    fn defaults_match_the_reference_deployment() {
        let cfg = defaults();
        assert_eq!(cfg.queue, "edge_frames");
        assert_eq!(cfg.broker.addr, "127.0.0.1:1883");
        assert_eq!(cfg.publisher.stream_id, "camera-stream-001");
        assert_eq!(
            cfg.publisher.location.as_deref(),
            Some("edge-location-bldg4-floor2")
        );
        assert_eq!(cfg.consumer.prefetch, 1);
        assert_eq!(cfg.consumer.ack_mode, AckMode::Auto);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn consumer_client_id_is_stable() {
        let cfg = defaults();
        let a = cfg.consumer_broker_settings();
        let b = cfg.consumer_broker_settings();
        assert_eq!(a.client_id, "frame-consumer-edge_frames");
        assert_eq!(a.client_id, b.client_id);
        assert_eq!(a.session_expiry_secs, Some(DEFAULT_SESSION_EXPIRY_SECS));
        assert_eq!(cfg.publisher_broker_settings().session_expiry_secs, None);
    }

    #[test]
    fn prefetch_becomes_the_consumer_receive_maximum() {
        let mut cfg = defaults();
        cfg.consumer.prefetch = 6;
        let consumer = cfg.consumer_broker_settings();
        assert_eq!(consumer.receive_maximum, Some(6));
        assert_eq!(consumer.share_group.as_deref(), Some(DEFAULT_SHARE_GROUP));

        let publisher = cfg.publisher_broker_settings();
        assert_eq!(publisher.receive_maximum, None);
        assert_eq!(publisher.share_group, None);
    }

    #[test]
    fn empty_share_group_subscribes_to_the_plain_topic() {
        let file = BridgeConfigFile {
            consumer: Some(ConsumerConfigFile {
                share_group: Some(String::new()),
                ..ConsumerConfigFile::default()
            }),
            ..BridgeConfigFile::default()
        };
        let cfg = BridgeConfig::from_file(file).unwrap();
        assert_eq!(cfg.consumer_broker_settings().share_group, None);

        let mut bad = defaults();
        bad.consumer.share_group = Some("a/b".to_string());
        assert!(bad.validate().is_err());
    }

    #[test]
    fn bad_policy_names_are_rejected() {
        let file = BridgeConfigFile {
            consumer: Some(ConsumerConfigFile {
                ack_mode: Some("eventually".to_string()),
                ..ConsumerConfigFile::default()
            }),
            ..BridgeConfigFile::default()
        };
        let err = BridgeConfig::from_file(file).unwrap_err();
        assert!(format!("{:#}", err).contains("consumer.ack_mode"));
    }

    #[test]
    fn parse_bool_forms() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
