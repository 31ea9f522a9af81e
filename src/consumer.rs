//! Frame consumer.
//!
//! The calling thread is the broker adapter: it pulls deliveries, decodes envelopes and queues
//! a [`DeliveryContext`] for a pool of worker threads, which decode the JPEG payload, call the
//! sink and resolve the delivery. The hand-off channel holds at most `prefetch` contexts, so
//! with auto-ack the adapter stops pulling when workers fall behind; with manual ack the broker
//! itself never has more than `prefetch` deliveries outstanding.
//!
//! Nothing that goes wrong with a single delivery stops the loop, a panicking sink included.
//! Broker errors do.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::anyhow;

use crate::envelope::{self, EnvelopeError, EnvelopeMetadata};
use crate::error::{BridgeError, Result};
use crate::frame::Frame;
use crate::shutdown::Shutdown;
use crate::sink::FrameSink;
use crate::transport::{validate_queue_name, AckHandle, AckMode, Broker, BrokerLease, FlowControl};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// How a delivery is settled with the broker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    Ack,
    Reject,
}

impl FromStr for Resolution {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "ack" => Ok(Self::Ack),
            "reject" => Ok(Self::Reject),
            other => Err(anyhow!(
                "unknown resolution '{}': expected 'ack' or 'reject'",
                other
            )),
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ack => write!(f, "ack"),
            Self::Reject => write!(f, "reject"),
        }
    }
}

/// What happens to deliveries still queued for workers when the consumer stops.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ShutdownPolicy {
    /// Process them.
    #[default]
    Drain,
    /// Reject them without calling the sink.
    Discard,
}

impl FromStr for ShutdownPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "drain" => Ok(Self::Drain),
            "discard" => Ok(Self::Discard),
            other => Err(anyhow!(
                "unknown shutdown policy '{}': expected 'drain' or 'discard'",
                other
            )),
        }
    }
}

impl std::fmt::Display for ShutdownPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Drain => write!(f, "drain"),
            Self::Discard => write!(f, "discard"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConsumerSettings {
    pub queue: String,
    /// Maximum deliveries in flight. Must be at least 1.
    pub prefetch: u16,
    pub ack_mode: AckMode,
    pub workers: usize,
    pub on_decode_failure: Resolution,
    pub on_sink_failure: Resolution,
    pub shutdown: ShutdownPolicy,
    /// How long one broker poll waits before the shutdown token is checked again.
    pub poll_interval: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            queue: "edge_frames".to_string(),
            prefetch: 1,
            ack_mode: AckMode::Auto,
            workers: 1,
            on_decode_failure: Resolution::Ack,
            on_sink_failure: Resolution::Ack,
            shutdown: ShutdownPolicy::Drain,
            poll_interval: Duration::from_millis(200),
        }
    }
}

impl ConsumerSettings {
    pub fn validate(&self) -> Result<()> {
        validate_queue_name(&self.queue)?;
        if self.prefetch == 0 {
            return Err(BridgeError::Config("prefetch must be at least 1".to_string()));
        }
        if self.workers == 0 {
            return Err(BridgeError::Config("workers must be at least 1".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(BridgeError::Config(
                "poll_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn flow_control(&self) -> FlowControl {
        FlowControl {
            prefetch: self.prefetch,
            ack_mode: self.ack_mode,
        }
    }
}

/// Consumer lifecycle.
///
/// ```text
/// Idle -> Connected -> Subscribed <-> Processing
///   any state except Closed -> ShuttingDown -> Closed
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConsumerState {
    Idle = 0,
    Connected = 1,
    Subscribed = 2,
    Processing = 3,
    ShuttingDown = 4,
    Closed = 5,
}

impl ConsumerState {
    pub fn can_transition_to(self, next: ConsumerState) -> bool {
        use ConsumerState::*;
        match (self, next) {
            (Idle, Connected) | (Connected, Subscribed) => true,
            (Subscribed, Processing) | (Processing, Subscribed) => true,
            (ShuttingDown, Closed) => true,
            (Closed, _) | (ShuttingDown, ShuttingDown) => false,
            (_, ShuttingDown) => true,
            _ => false,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Connected,
            2 => Self::Subscribed,
            3 => Self::Processing,
            4 => Self::ShuttingDown,
            _ => Self::Closed,
        }
    }
}

impl std::fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Live counters.
#[derive(Default)]
pub struct ConsumerStats {
    received: AtomicU64,
    dispatched: AtomicU64,
    metadata_only: AtomicU64,
    decode_failures: AtomicU64,
    image_failures: AtomicU64,
    sink_failures: AtomicU64,
    acked: AtomicU64,
    rejected: AtomicU64,
    discarded: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Counter snapshot, returned when the consumer stops.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsumerReport {
    pub received: u64,
    /// Sink calls that succeeded, frames and metadata-only alike.
    pub dispatched: u64,
    /// Successful sink calls that carried no frame.
    pub metadata_only: u64,
    pub decode_failures: u64,
    pub image_failures: u64,
    pub sink_failures: u64,
    pub acked: u64,
    pub rejected: u64,
    /// Rejected unprocessed because of `ShutdownPolicy::Discard`. Also counted in `rejected`.
    pub discarded: u64,
    pub elapsed: Duration,
}

impl ConsumerStats {
    pub fn snapshot(&self) -> ConsumerReport {
        ConsumerReport {
            received: self.received.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            metadata_only: self.metadata_only.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            image_failures: self.image_failures.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            elapsed: Duration::ZERO,
        }
    }
}

struct Shared {
    state: AtomicU8,
    in_flight: AtomicUsize,
    stats: ConsumerStats,
}

/// Read-only view of a running consumer.
#[derive(Clone)]
pub struct ConsumerMonitor {
    shared: Arc<Shared>,
}

impl ConsumerMonitor {
    /// Current state. `Processing` while any worker holds a delivery.
    pub fn state(&self) -> ConsumerState {
        let base = ConsumerState::from_u8(self.shared.state.load(Ordering::SeqCst));
        if base == ConsumerState::Subscribed && self.shared.in_flight.load(Ordering::SeqCst) > 0 {
            ConsumerState::Processing
        } else {
            base
        }
    }

    pub fn stats(&self) -> ConsumerReport {
        self.shared.stats.snapshot()
    }
}

/// Image part of a decoded delivery.
#[derive(Debug)]
pub enum Payload {
    Jpeg(Vec<u8>),
    Absent,
    /// The envelope carried image data that could not be turned into bytes.
    Unreadable(String),
}

/// One delivery on its way from the adapter to a worker.
#[derive(Debug)]
pub struct DeliveryContext {
    pub tag: u64,
    pub meta: EnvelopeMetadata,
    pub payload: Payload,
    pub ack: AckHandle,
}

pub struct FrameConsumer<S: FrameSink> {
    settings: ConsumerSettings,
    sink: Mutex<S>,
    shared: Arc<Shared>,
}

impl<S: FrameSink> FrameConsumer<S> {
    pub fn new(settings: ConsumerSettings, sink: S) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            sink: Mutex::new(sink),
            shared: Arc::new(Shared {
                state: AtomicU8::new(ConsumerState::Idle as u8),
                in_flight: AtomicUsize::new(0),
                stats: ConsumerStats::default(),
            }),
        })
    }

    pub fn monitor(&self) -> ConsumerMonitor {
        ConsumerMonitor {
            shared: self.shared.clone(),
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.monitor().state()
    }

    fn advance(&self, next: ConsumerState) {
        let current = ConsumerState::from_u8(self.shared.state.load(Ordering::SeqCst));
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            log::warn!("ignoring consumer transition {} -> {}", current, next);
            return;
        }
        log::debug!("consumer {} -> {}", current, next);
        self.shared.state.store(next as u8, Ordering::SeqCst);
    }

    /// Subscribe on `broker` and consume until `shutdown` fires or the broker fails. The broker
    /// is closed before this returns.
    pub fn run<B: Broker>(self, broker: B, shutdown: &Shutdown) -> Result<ConsumerReport> {
        let started = Instant::now();
        let mut lease = BrokerLease::new(broker);
        self.advance(ConsumerState::Connected);

        let outcome = self.subscribe(&mut lease).and_then(|()| {
            self.advance(ConsumerState::Subscribed);
            self.dispatch(&mut lease, shutdown)
        });

        self.advance(ConsumerState::ShuttingDown);
        if let Err(e) = lease.release() {
            log::warn!("broker close failed: {}", e);
        }
        self.advance(ConsumerState::Closed);

        let mut report = self.shared.stats.snapshot();
        report.elapsed = started.elapsed();
        match &outcome {
            Ok(()) => log::info!(
                "consumer stopped: received={} dispatched={} acked={} rejected={} in {:.1}s",
                report.received,
                report.dispatched,
                report.acked,
                report.rejected,
                report.elapsed.as_secs_f64()
            ),
            Err(e) => log::error!("consumer halted: {}", e),
        }
        outcome.map(|()| report)
    }

    fn subscribe<B: Broker>(&self, lease: &mut BrokerLease<B>) -> Result<()> {
        let broker = lease.get();
        broker.declare_queue(&self.settings.queue)?;
        broker.subscribe(&self.settings.queue, self.settings.flow_control())?;
        log::info!(
            "consuming {} prefetch={} ack={} workers={} shutdown={}",
            self.settings.queue,
            self.settings.prefetch,
            self.settings.ack_mode,
            self.settings.workers,
            self.settings.shutdown
        );
        Ok(())
    }

    fn dispatch<B: Broker>(&self, lease: &mut BrokerLease<B>, shutdown: &Shutdown) -> Result<()> {
        let (tx, rx) = mpsc::sync_channel::<DeliveryContext>(self.settings.prefetch as usize);
        let rx = Mutex::new(rx);
        let halted = AtomicBool::new(false);

        std::thread::scope(|scope| {
            for id in 0..self.settings.workers {
                let rx = &rx;
                let halted = &halted;
                scope.spawn(move || self.work(id, rx, halted, shutdown));
            }
            let outcome = self.pump(lease, &tx, shutdown);
            halted.store(true, Ordering::SeqCst);
            self.advance(ConsumerState::ShuttingDown);
            drop(tx);
            outcome
        })
    }

    /// Adapter loop: broker to channel.
    fn pump<B: Broker>(
        &self,
        lease: &mut BrokerLease<B>,
        tx: &SyncSender<DeliveryContext>,
        shutdown: &Shutdown,
    ) -> Result<()> {
        let mut last_health = Instant::now();
        loop {
            if last_health.elapsed() >= HEALTH_LOG_INTERVAL {
                let s = self.shared.stats.snapshot();
                log::info!(
                    "consumer health: state={} received={} dispatched={} decode_failures={} image_failures={} sink_failures={}",
                    self.state(),
                    s.received,
                    s.dispatched,
                    s.decode_failures,
                    s.image_failures,
                    s.sink_failures
                );
                last_health = Instant::now();
            }
            if shutdown.is_triggered() {
                return Ok(());
            }

            let delivery = match lease.get().next_delivery(self.settings.poll_interval) {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(e) if shutdown.is_triggered() => {
                    log::info!("broker went away during shutdown: {}", e);
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            bump(&self.shared.stats.received);

            let (meta, payload) = match envelope::decode(&delivery.body) {
                Ok(env) => {
                    let payload = match env.image_payload {
                        Some(bytes) => Payload::Jpeg(bytes),
                        None => Payload::Absent,
                    };
                    (env.meta, payload)
                }
                Err(EnvelopeError::ImagePayload { meta, reason }) => {
                    (meta, Payload::Unreadable(reason))
                }
                Err(e) => {
                    bump(&self.shared.stats.decode_failures);
                    log::warn!(
                        "dropping delivery tag={}: {}",
                        delivery.tag,
                        BridgeError::from(e)
                    );
                    self.resolve(delivery.ack, self.settings.on_decode_failure);
                    continue;
                }
            };

            let ctx = DeliveryContext {
                tag: delivery.tag,
                meta,
                payload,
                ack: delivery.ack,
            };
            if let Err(mpsc::SendError(ctx)) = tx.send(ctx) {
                log::warn!("no worker left for tag={}, rejecting", ctx.tag);
                self.resolve(ctx.ack, Resolution::Reject);
                return Ok(());
            }
        }
    }

    fn work(
        &self,
        id: usize,
        rx: &Mutex<Receiver<DeliveryContext>>,
        halted: &AtomicBool,
        shutdown: &Shutdown,
    ) {
        loop {
            let next = lock(rx).recv();
            let ctx = match next {
                Ok(ctx) => ctx,
                Err(_) => break,
            };
            self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
            let stopping = shutdown.is_triggered() || halted.load(Ordering::SeqCst);
            if stopping && self.settings.shutdown == ShutdownPolicy::Discard {
                bump(&self.shared.stats.discarded);
                log::debug!("discarding tag={} {}", ctx.tag, ctx.meta);
                self.resolve(ctx.ack, Resolution::Reject);
            } else {
                let tag = ctx.tag;
                // The delivery is rejected when its handle drops during the unwind.
                let processed = panic::catch_unwind(AssertUnwindSafe(|| self.process(ctx)));
                if let Err(payload) = processed {
                    log::error!(
                        "worker {} recovered from panic on tag={}: {}",
                        id,
                        tag,
                        panic_message(payload.as_ref())
                    );
                }
            }
            self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        log::debug!("consumer worker {} exiting", id);
    }

    fn process(&self, ctx: DeliveryContext) {
        let DeliveryContext {
            tag,
            meta,
            payload,
            ack,
        } = ctx;

        let resolution = match payload {
            Payload::Jpeg(bytes) => match Frame::decode_jpeg(&bytes) {
                Ok(frame) => {
                    log::info!("frame tag={} {} {}x{}", tag, meta, frame.width, frame.height);
                    self.hand_to_sink(Some(&frame), &meta)
                }
                Err(reason) => self.image_failed(tag, &meta, reason),
            },
            Payload::Unreadable(reason) => self.image_failed(tag, &meta, reason),
            Payload::Absent => {
                log::info!("no image data tag={} {}", tag, meta);
                self.metadata_only(&meta)
            }
        };
        self.resolve(ack, resolution);
    }

    fn image_failed(&self, tag: u64, meta: &EnvelopeMetadata, reason: String) -> Resolution {
        bump(&self.shared.stats.image_failures);
        let err = BridgeError::ImagePayloadDecode {
            stream_id: meta.stream_id.clone(),
            reason,
        };
        log::warn!("tag={} timestamp={}: {}", tag, meta.timestamp, err);
        self.metadata_only(meta)
    }

    fn metadata_only(&self, meta: &EnvelopeMetadata) -> Resolution {
        let accepts = lock(&self.sink).accepts_metadata_only();
        if accepts {
            self.hand_to_sink(None, meta)
        } else {
            Resolution::Ack
        }
    }

    fn hand_to_sink(&self, frame: Option<&Frame>, meta: &EnvelopeMetadata) -> Resolution {
        let mut sink = lock(&self.sink);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| sink.consume(frame, meta)))
            .unwrap_or_else(|payload| {
                Err(anyhow!("panicked: {}", panic_message(payload.as_ref())))
            });
        match outcome {
            Ok(()) => {
                bump(&self.shared.stats.dispatched);
                if frame.is_none() {
                    bump(&self.shared.stats.metadata_only);
                }
                Resolution::Ack
            }
            Err(e) => {
                bump(&self.shared.stats.sink_failures);
                let err = BridgeError::SinkProcessing {
                    sink: sink.name(),
                    stream_id: meta.stream_id.clone(),
                    reason: format!("{:#}", e),
                };
                log::warn!("timestamp={}: {}", meta.timestamp, err);
                self.settings.on_sink_failure
            }
        }
    }

    fn resolve(&self, ack: AckHandle, resolution: Resolution) {
        if !ack.is_pending() {
            return;
        }
        let tag = ack.tag();
        let result = match resolution {
            Resolution::Ack => ack.ack(),
            Resolution::Reject => ack.reject(),
        };
        match result {
            Ok(()) => match resolution {
                Resolution::Ack => bump(&self.shared.stats.acked),
                Resolution::Reject => bump(&self.shared.stats.rejected),
            },
            Err(e) => log::warn!("{} of tag={} failed: {}", resolution, tag, e),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
