//! Publisher and consumer wired through the in-memory broker.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use frame_bridge::transport::BrokerEvent;
use frame_bridge::{
    decode, encode, AckMode, Broker, BridgeError, ConsumerReport, ConsumerSettings,
    ConsumerState, EnvelopeMetadata, Frame, FrameConsumer, FrameEnvelope, FramePublisher,
    FrameSink, InMemoryBroker, PublisherSettings, Resolution, Shutdown, ShutdownPolicy,
};
use frame_bridge::ingest::SyntheticSource;

const QUEUE: &str = "edge_frames";
const WAIT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
struct Seen {
    meta: EnvelopeMetadata,
    frame: Option<(u32, u32, [u8; 3])>,
}

#[derive(Default)]
struct RecordingSink {
    seen: Arc<Mutex<Vec<Seen>>>,
    delay_first: Option<Duration>,
    delay_each: Option<Duration>,
    fail_stream: Option<String>,
    panic_stream: Option<String>,
    frames_only: bool,
}

impl RecordingSink {
    fn new() -> (Self, Arc<Mutex<Vec<Seen>>>) {
        let sink = Self::default();
        let seen = sink.seen.clone();
        (sink, seen)
    }
}

impl FrameSink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn accepts_metadata_only(&self) -> bool {
        !self.frames_only
    }

    fn consume(&mut self, frame: Option<&Frame>, meta: &EnvelopeMetadata) -> anyhow::Result<()> {
        let first = self.seen.lock().unwrap().is_empty();
        if first {
            if let Some(delay) = self.delay_first {
                thread::sleep(delay);
            }
        }
        if let Some(delay) = self.delay_each {
            thread::sleep(delay);
        }
        if self.panic_stream.as_deref() == Some(meta.stream_id.as_str()) {
            panic!("sink blew up on {}", meta.stream_id);
        }
        if self.fail_stream.as_deref() == Some(meta.stream_id.as_str()) {
            anyhow::bail!("sink rejected stream {}", meta.stream_id);
        }
        self.seen.lock().unwrap().push(Seen {
            meta: meta.clone(),
            frame: frame.map(|f| (f.width, f.height, f.pixel(0, 0).unwrap())),
        });
        Ok(())
    }
}

fn settings(prefetch: u16, ack_mode: AckMode) -> ConsumerSettings {
    ConsumerSettings {
        queue: QUEUE.to_string(),
        prefetch,
        ack_mode,
        poll_interval: Duration::from_millis(10),
        ..ConsumerSettings::default()
    }
}

fn envelope(stream: &str, image: Option<Vec<u8>>) -> FrameEnvelope {
    FrameEnvelope::new(
        "2024-01-01T00:00:00Z",
        stream,
        Some("bldg4-floor2".to_string()),
        image,
    )
}

fn red_jpeg() -> Vec<u8> {
    Frame::filled(2, 2, [255, 0, 0])
        .unwrap()
        .encode_jpeg(95)
        .unwrap()
}

/// Run `consumer` on its own connection until `done` holds for its counters, then trigger
/// shutdown and return what `run` returned.
fn run_until<S>(
    consumer: FrameConsumer<S>,
    broker: &InMemoryBroker,
    done: impl Fn(&ConsumerReport) -> bool + Send + 'static,
) -> Result<ConsumerReport, BridgeError>
where
    S: FrameSink,
{
    let shutdown = Shutdown::new();
    let monitor = consumer.monitor();
    let stopper = shutdown.clone();
    let watcher = thread::spawn(move || {
        let deadline = Instant::now() + WAIT;
        while !done(&monitor.stats()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        stopper.trigger();
    });
    let outcome = consumer.run(broker.connect(), &shutdown);
    watcher.join().unwrap();
    outcome
}

fn position(events: &[BrokerEvent], wanted: &BrokerEvent) -> usize {
    events
        .iter()
        .position(|e| e == wanted)
        .unwrap_or_else(|| panic!("{:?} not in {:?}", wanted, events))
}

#[test]
fn frame_and_metadata_arrive_intact() {
    let mut producer = InMemoryBroker::new();
    let sent = envelope("camera-stream-001", Some(red_jpeg()));
    assert_eq!(decode(&encode(&sent)).unwrap(), sent);
    producer.publish(QUEUE, encode(&sent)).unwrap();

    let (sink, seen) = RecordingSink::new();
    let consumer = FrameConsumer::new(settings(1, AckMode::Manual), sink).unwrap();
    let report = run_until(consumer, &producer, |s| s.dispatched >= 1).unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].meta.timestamp, "2024-01-01T00:00:00Z");
    assert_eq!(seen[0].meta.stream_id, "camera-stream-001");
    assert_eq!(seen[0].meta.location.as_deref(), Some("bldg4-floor2"));
    let (w, h, [r, g, b]) = seen[0].frame.unwrap();
    assert_eq!((w, h), (2, 2));
    assert!(r > 200 && g < 60 && b < 60, "pixel {:?}", (r, g, b));
    assert_eq!(report.acked, 1);
    assert_eq!(report.image_failures, 0);
}

#[test]
fn missing_image_is_forwarded_as_metadata() {
    let mut producer = InMemoryBroker::new();
    producer
        .publish(QUEUE, encode(&envelope("camera-stream-001", None)))
        .unwrap();

    let (sink, seen) = RecordingSink::new();
    let consumer = FrameConsumer::new(settings(1, AckMode::Manual), sink).unwrap();
    let report = run_until(consumer, &producer, |s| s.dispatched >= 1).unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].frame.is_none());
    assert_eq!(report.metadata_only, 1);
    assert_eq!(report.image_failures, 0);
    assert_eq!(report.decode_failures, 0);
    assert_eq!(report.acked, 1);
}

#[test]
fn missing_image_is_skipped_for_frame_only_sinks() {
    let mut producer = InMemoryBroker::new();
    let observer = producer.observer();
    producer
        .publish(QUEUE, encode(&envelope("camera-stream-001", None)))
        .unwrap();

    let (mut sink, seen) = RecordingSink::new();
    sink.frames_only = true;
    let consumer = FrameConsumer::new(settings(1, AckMode::Manual), sink).unwrap();
    let watch = observer.clone();
    let report = run_until(consumer, &producer, move |_| watch.acked().len() == 1).unwrap();

    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(report.dispatched, 0);
    assert_eq!(report.acked, 1);
}

#[test]
fn prefetch_one_withholds_next_until_ack() {
    let mut producer = InMemoryBroker::new();
    let observer = producer.observer();
    for i in 0..5 {
        let stream = format!("camera-stream-{:03}", i + 1);
        producer
            .publish(QUEUE, encode(&envelope(&stream, Some(red_jpeg()))))
            .unwrap();
    }

    let (mut sink, seen) = RecordingSink::new();
    sink.delay_first = Some(Duration::from_millis(500));
    let consumer = FrameConsumer::new(settings(1, AckMode::Manual), sink).unwrap();
    let report = run_until(consumer, &producer, |s| s.acked >= 5).unwrap();

    let events = observer.events();
    let acked_first = position(&events, &BrokerEvent::Acked(1));
    let delivered_second = position(&events, &BrokerEvent::Delivered(2));
    assert!(
        acked_first < delivered_second,
        "message 2 delivered before message 1 was acked: {:?}",
        events
    );
    assert_eq!(observer.peak_outstanding(), 1);
    assert_eq!(report.acked, 5);

    let order: Vec<String> = seen
        .lock()
        .unwrap()
        .iter()
        .map(|s| s.meta.stream_id.clone())
        .collect();
    assert_eq!(order[0], "camera-stream-001");
    assert_eq!(order.len(), 5);
}

#[test]
fn backpressure_bound_holds_with_more_workers_than_prefetch() {
    let mut producer = InMemoryBroker::new();
    let observer = producer.observer();
    for _ in 0..20 {
        producer
            .publish(QUEUE, encode(&envelope("camera-stream-001", Some(red_jpeg()))))
            .unwrap();
    }

    let (mut sink, _seen) = RecordingSink::new();
    sink.delay_each = Some(Duration::from_millis(10));
    let consumer = FrameConsumer::new(
        ConsumerSettings {
            workers: 4,
            ..settings(3, AckMode::Manual)
        },
        sink,
    )
    .unwrap();
    let report = run_until(consumer, &producer, |s| s.acked >= 20).unwrap();

    assert_eq!(report.acked, 20);
    assert!(observer.peak_outstanding() <= 3, "peak {}", observer.peak_outstanding());
    assert_eq!(observer.outstanding(), 0);
}

#[test]
fn malformed_input_does_not_stop_the_consumer() {
    let mut producer = InMemoryBroker::new();
    let observer = producer.observer();
    producer.publish(QUEUE, b"\xff\xfe not json".to_vec()).unwrap();
    producer
        .publish(QUEUE, br#"{"timestamp":"2024-01-01T00:00:00Z"}"#.to_vec())
        .unwrap();
    producer.publish(QUEUE, b"[1,2,3]".to_vec()).unwrap();
    producer
        .publish(QUEUE, encode(&envelope("camera-stream-001", Some(red_jpeg()))))
        .unwrap();

    let (sink, seen) = RecordingSink::new();
    let consumer = FrameConsumer::new(
        ConsumerSettings {
            on_decode_failure: Resolution::Reject,
            ..settings(1, AckMode::Manual)
        },
        sink,
    )
    .unwrap();
    let report = run_until(consumer, &producer, |s| s.dispatched >= 1).unwrap();

    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(report.received, 4);
    assert_eq!(report.decode_failures, 3);
    assert_eq!(observer.rejected(), vec![1, 2, 3]);
    assert_eq!(observer.acked(), vec![4]);
}

#[test]
fn undecodable_image_still_forwards_metadata() {
    let mut producer = InMemoryBroker::new();
    producer
        .publish(
            QUEUE,
            br#"{"timestamp":"2024-01-01T00:00:00Z","stream_id":"cam-a","image_data":"%%%"}"#
                .to_vec(),
        )
        .unwrap();
    producer
        .publish(QUEUE, encode(&envelope("cam-b", Some(b"not a jpeg".to_vec()))))
        .unwrap();

    let (sink, seen) = RecordingSink::new();
    let consumer = FrameConsumer::new(settings(2, AckMode::Manual), sink).unwrap();
    let report = run_until(consumer, &producer, |s| s.dispatched >= 2).unwrap();

    let seen = seen.lock().unwrap();
    let mut streams: Vec<&str> = seen.iter().map(|s| s.meta.stream_id.as_str()).collect();
    streams.sort();
    assert_eq!(streams, vec!["cam-a", "cam-b"]);
    assert!(seen.iter().all(|s| s.frame.is_none()));
    assert_eq!(report.image_failures, 2);
    assert_eq!(report.acked, 2);
}

#[test]
fn sink_failure_is_resolved_by_policy_and_consumption_continues() {
    let mut producer = InMemoryBroker::new();
    let observer = producer.observer();
    producer
        .publish(QUEUE, encode(&envelope("broken", Some(red_jpeg()))))
        .unwrap();
    producer
        .publish(QUEUE, encode(&envelope("healthy", Some(red_jpeg()))))
        .unwrap();

    let (mut sink, seen) = RecordingSink::new();
    sink.fail_stream = Some("broken".to_string());
    let consumer = FrameConsumer::new(
        ConsumerSettings {
            on_sink_failure: Resolution::Reject,
            ..settings(1, AckMode::Manual)
        },
        sink,
    )
    .unwrap();
    let report = run_until(consumer, &producer, |s| s.dispatched >= 1).unwrap();

    assert_eq!(seen.lock().unwrap()[0].meta.stream_id, "healthy");
    assert_eq!(report.sink_failures, 1);
    assert_eq!(observer.rejected(), vec![1]);
    assert_eq!(observer.acked(), vec![2]);
}

#[test]
fn panicking_sink_is_treated_as_a_sink_failure() {
    let mut producer = InMemoryBroker::new();
    let observer = producer.observer();
    producer
        .publish(QUEUE, encode(&envelope("boom", Some(red_jpeg()))))
        .unwrap();
    for _ in 0..4 {
        producer
            .publish(QUEUE, encode(&envelope("camera-stream-001", Some(red_jpeg()))))
            .unwrap();
    }

    let (mut sink, seen) = RecordingSink::new();
    sink.panic_stream = Some("boom".to_string());
    let consumer = FrameConsumer::new(
        ConsumerSettings {
            on_sink_failure: Resolution::Reject,
            ..settings(1, AckMode::Manual)
        },
        sink,
    )
    .unwrap();
    let report = run_until(consumer, &producer, |s| s.dispatched >= 4).unwrap();

    assert_eq!(seen.lock().unwrap().len(), 4);
    assert_eq!(report.received, 5);
    assert_eq!(report.sink_failures, 1);
    assert_eq!(observer.rejected(), vec![1]);
    assert_eq!(observer.acked(), vec![2, 3, 4, 5]);
}

#[test]
fn discard_policy_rejects_queued_deliveries_on_shutdown() {
    let mut producer = InMemoryBroker::new();
    let observer = producer.observer();
    for _ in 0..4 {
        producer
            .publish(QUEUE, encode(&envelope("camera-stream-001", Some(red_jpeg()))))
            .unwrap();
    }

    let (mut sink, seen) = RecordingSink::new();
    sink.delay_first = Some(Duration::from_millis(300));
    let consumer = FrameConsumer::new(
        ConsumerSettings {
            shutdown: ShutdownPolicy::Discard,
            ..settings(4, AckMode::Manual)
        },
        sink,
    )
    .unwrap();
    let report = run_until(consumer, &producer, |s| s.received >= 4).unwrap();

    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(report.discarded, 3);
    assert_eq!(observer.acked(), vec![1]);
    assert_eq!(observer.rejected(), vec![2, 3, 4]);
}

#[test]
fn double_shutdown_closes_once() {
    let producer = InMemoryBroker::new();
    let observer = producer.observer();
    let (sink, _seen) = RecordingSink::new();
    let consumer = FrameConsumer::new(settings(1, AckMode::Auto), sink).unwrap();
    let monitor = consumer.monitor();

    let shutdown = Shutdown::new();
    assert!(shutdown.trigger());
    assert!(!shutdown.trigger());
    let report = consumer.run(producer.connect(), &shutdown).unwrap();

    assert_eq!(report.received, 0);
    assert_eq!(monitor.state(), ConsumerState::Closed);
    assert_eq!(observer.close_calls(), 1);
    assert_eq!(observer.closed_connections(), 1);
}

#[test]
fn broker_loss_halts_the_consumer_with_a_fatal_error() {
    let producer = InMemoryBroker::new();
    let observer = producer.observer();
    let (sink, _seen) = RecordingSink::new();
    let consumer = FrameConsumer::new(settings(1, AckMode::Manual), sink).unwrap();
    let monitor = consumer.monitor();

    let severer = observer.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        severer.sever();
    });
    let err = consumer.run(producer.connect(), &Shutdown::new()).unwrap_err();
    handle.join().unwrap();

    assert!(err.is_fatal());
    assert_eq!(monitor.state(), ConsumerState::Closed);
    assert_eq!(observer.closed_connections(), 1);
}

#[test]
fn publisher_to_consumer_end_to_end() {
    let broker = InMemoryBroker::new();
    let observer = broker.observer();

    let publisher = FramePublisher::new(
        Box::new(SyntheticSource::new("stub://e2e", 64, 48).unwrap()),
        PublisherSettings {
            queue: QUEUE.to_string(),
            fps: 50.0,
            ..PublisherSettings::default()
        },
        broker.connect(),
    )
    .unwrap();
    let publisher_stop = Shutdown::new();
    let publisher_thread = {
        let stop = publisher_stop.clone();
        thread::spawn(move || publisher.run(&stop))
    };

    let (sink, seen) = RecordingSink::new();
    let consumer = FrameConsumer::new(settings(2, AckMode::Auto), sink).unwrap();
    let report = run_until(consumer, &broker, |s| s.dispatched >= 5).unwrap();

    publisher_stop.trigger();
    let published = publisher_thread.join().unwrap().unwrap();

    assert!(published.frames_published >= 5);
    assert!(report.dispatched >= 5);
    assert_eq!(report.acked, 0, "auto mode settles on delivery");
    assert_eq!(observer.outstanding(), 0);

    let seen = seen.lock().unwrap();
    assert!(seen.iter().all(|s| s.meta.stream_id == "camera-stream-001"));
    assert!(seen.iter().all(|s| matches!(s.frame, Some((64, 48, _)))));
    assert_eq!(observer.closed_connections(), 2);
}
