//! Frame publisher.
//!
//! Pulls frames from a [`FrameSource`], compresses them, wraps each in an envelope and hands
//! it to the broker at a fixed rate. The broker connection lives in a [`BrokerLease`], so it is
//! closed exactly once however the publisher stops.

use std::time::{Duration, Instant};

use crate::envelope::{self, FrameEnvelope};
use crate::error::{BridgeError, Disposition, Result};
use crate::frame::DEFAULT_JPEG_QUALITY;
use crate::ingest::FrameSource;
use crate::shutdown::Shutdown;
use crate::transport::{validate_queue_name, Broker, BrokerLease};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct PublisherSettings {
    pub queue: String,
    pub stream_id: String,
    pub location: Option<String>,
    /// Target frames per second.
    pub fps: f64,
    pub jpeg_quality: u8,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            queue: "edge_frames".to_string(),
            stream_id: "camera-stream-001".to_string(),
            location: Some("edge-location-bldg4-floor2".to_string()),
            fps: 1.0,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl PublisherSettings {
    pub fn validate(&self) -> Result<()> {
        validate_queue_name(&self.queue)?;
        if self.stream_id.trim().is_empty() {
            return Err(BridgeError::Config("stream_id must be non-empty".to_string()));
        }
        if !self.fps.is_finite() || self.fps <= 0.0 {
            return Err(BridgeError::Config(format!(
                "fps must be a positive number (got {})",
                self.fps
            )));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(BridgeError::Config(format!(
                "jpeg_quality must be within 1..=100 (got {})",
                self.jpeg_quality
            )));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps)
    }
}

#[derive(Clone, Debug, Default)]
pub struct PublisherReport {
    pub frames_published: u64,
    pub capture_failures: u64,
    pub encode_failures: u64,
    pub elapsed: Duration,
}

pub struct FramePublisher<B: Broker> {
    source: Box<dyn FrameSource>,
    settings: PublisherSettings,
    lease: BrokerLease<B>,
    report: PublisherReport,
}

impl<B: Broker> FramePublisher<B> {
    /// Takes ownership of a connected broker and declares the target queue.
    pub fn new(
        source: Box<dyn FrameSource>,
        settings: PublisherSettings,
        broker: B,
    ) -> Result<Self> {
        let mut lease = BrokerLease::new(broker);
        settings.validate()?;
        lease.get().declare_queue(&settings.queue)?;
        log::info!(
            "publisher ready: source={} queue={} stream={} fps={}",
            source.describe(),
            settings.queue,
            settings.stream_id,
            settings.fps
        );
        Ok(Self {
            source,
            settings,
            lease,
            report: PublisherReport::default(),
        })
    }

    pub fn settings(&self) -> &PublisherSettings {
        &self.settings
    }

    /// Capture, compress, wrap and publish one frame. Returns the envelope that went out.
    pub fn publish_next(&mut self) -> Result<FrameEnvelope> {
        let frame = self
            .source
            .next_frame()
            .map_err(|e| BridgeError::FrameCapture(format!("{:#}", e)))?;
        let jpeg = frame.encode_jpeg(self.settings.jpeg_quality)?;
        let envelope = FrameEnvelope::now(
            self.settings.stream_id.clone(),
            self.settings.location.clone(),
            Some(jpeg),
        );
        let wire = envelope::encode(&envelope);
        let size = wire.len();
        self.lease.get().publish(&self.settings.queue, wire)?;
        self.report.frames_published += 1;
        log::debug!("published {} bytes={}", envelope.meta, size);
        Ok(envelope)
    }

    /// Publish at the configured rate until `shutdown` fires or the broker fails.
    pub fn run(mut self, shutdown: &Shutdown) -> Result<PublisherReport> {
        let interval = self.settings.interval();
        let started = Instant::now();
        let mut last_health = Instant::now();

        while !shutdown.is_triggered() {
            let tick = Instant::now();
            match self.publish_next() {
                Ok(_) => {}
                Err(e) => match e.disposition() {
                    Disposition::Retry => {
                        self.report.capture_failures += 1;
                        log::warn!("{}; retrying next tick", e);
                    }
                    Disposition::Skip => {
                        self.report.encode_failures += 1;
                        log::warn!("{}; frame skipped", e);
                    }
                    Disposition::Fatal => {
                        log::error!("publisher stopping: {}", e);
                        if let Err(close_err) = self.lease.release() {
                            log::warn!("broker close after failure: {}", close_err);
                        }
                        return Err(e);
                    }
                },
            }

            if last_health.elapsed() >= HEALTH_LOG_INTERVAL {
                log::info!(
                    "publisher health: published={} capture_failures={} encode_failures={}",
                    self.report.frames_published,
                    self.report.capture_failures,
                    self.report.encode_failures
                );
                last_health = Instant::now();
            }

            let pause = interval.saturating_sub(tick.elapsed());
            if shutdown.wait_timeout(pause) {
                break;
            }
        }

        self.lease.release()?;
        self.report.elapsed = started.elapsed();
        log::info!(
            "publisher stopped: published={} source frames={} in {:.1}s",
            self.report.frames_published,
            self.source.stats().frames_captured,
            self.report.elapsed.as_secs_f64()
        );
        Ok(self.report.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::decode;
    use crate::frame::Frame;
    use crate::ingest::{SourceStats, SyntheticSource};
    use crate::transport::{AckMode, FlowControl, InMemoryBroker};
    use anyhow::anyhow;

    /// Fails every other capture.
    struct FlakySource {
        calls: u64,
    }

    impl FrameSource for FlakySource {
        fn describe(&self) -> String {
            "flaky".to_string()
        }

        fn next_frame(&mut self) -> anyhow::Result<Frame> {
            self.calls += 1;
            if self.calls % 2 == 0 {
                return Err(anyhow!("sensor timeout"));
            }
            Ok(Frame::filled(8, 8, [50, 60, 70])?)
        }

        fn stats(&self) -> SourceStats {
            SourceStats {
                frames_captured: self.calls,
                source: "flaky".to_string(),
            }
        }
    }

    fn synthetic() -> Box<dyn FrameSource> {
        Box::new(SyntheticSource::new("stub://test", 64, 48).unwrap())
    }

    fn fast_settings() -> PublisherSettings {
        PublisherSettings {
            queue: "pub_test".to_string(),
            fps: 200.0,
            ..PublisherSettings::default()
        }
    }

    #[test]
    fn publish_next_sends_a_decodable_envelope() {
        let broker = InMemoryBroker::new();
        let mut reader = broker.connect();
        let observer = broker.observer();
        let mut publisher = FramePublisher::new(synthetic(), fast_settings(), broker).unwrap();
        assert!(observer.is_declared("pub_test"));

        let sent = publisher.publish_next().unwrap();
        reader
            .subscribe(
                "pub_test",
                FlowControl {
                    prefetch: 1,
                    ack_mode: AckMode::Auto,
                },
            )
            .unwrap();
        let delivery = reader
            .next_delivery(Duration::from_millis(50))
            .unwrap()
            .unwrap();
        let received = decode(&delivery.body).unwrap();
        assert_eq!(received, sent);
        assert_eq!(received.meta.stream_id, "camera-stream-001");
        assert_eq!(
            received.meta.location.as_deref(),
            Some("edge-location-bldg4-floor2")
        );
        let frame = Frame::decode_jpeg(received.image_payload.as_deref().unwrap()).unwrap();
        assert_eq!((frame.width, frame.height), (64, 48));
    }

    #[test]
    fn capture_failures_are_retried() {
        let broker = InMemoryBroker::new();
        let observer = broker.observer();
        let shutdown = Shutdown::new();
        let publisher =
            FramePublisher::new(Box::new(FlakySource { calls: 0 }), fast_settings(), broker)
                .unwrap();

        let stopper = shutdown.clone();
        let waiter = observer.clone();
        let handle = std::thread::spawn(move || {
            waiter.wait_for_published(3, Duration::from_secs(5));
            stopper.trigger();
        });
        let report = publisher.run(&shutdown).unwrap();
        handle.join().unwrap();

        assert!(report.frames_published >= 3);
        assert!(report.capture_failures >= 2);
        assert_eq!(observer.close_calls(), 1);
    }

    #[test]
    fn broker_failure_is_fatal_and_releases_the_connection() {
        let broker = InMemoryBroker::new();
        let observer = broker.observer();
        let publisher = FramePublisher::new(synthetic(), fast_settings(), broker).unwrap();
        observer.fail_publishes(true);

        let err = publisher.run(&Shutdown::new()).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(observer.close_calls(), 1);
        assert_eq!(observer.closed_connections(), 1);
    }

    #[test]
    fn pacing_follows_fps() {
        let broker = InMemoryBroker::new();
        let observer = broker.observer();
        let settings = PublisherSettings {
            fps: 20.0,
            ..fast_settings()
        };
        let publisher = FramePublisher::new(synthetic(), settings, broker).unwrap();
        let shutdown = Shutdown::new();
        let stopper = shutdown.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(500));
            stopper.trigger();
        });
        let report = publisher.run(&shutdown).unwrap();
        handle.join().unwrap();

        // 20 fps for half a second is about 10 frames.
        assert!(report.frames_published >= 4, "{:?}", report);
        assert!(report.frames_published <= 12, "{:?}", report);
        assert_eq!(observer.published().len() as u64, report.frames_published);
    }

    #[test]
    fn invalid_settings_still_close_the_broker() {
        let broker = InMemoryBroker::new();
        let observer = broker.observer();
        let settings = PublisherSettings {
            fps: 0.0,
            ..fast_settings()
        };
        assert!(FramePublisher::new(synthetic(), settings, broker).is_err());
        assert_eq!(observer.close_calls(), 1);
    }
}
