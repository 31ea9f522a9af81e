//! Frame Bridge
//!
//! Moves camera frames from an edge capture process to a downstream inference process through
//! a message broker.
//!
//! # Architecture
//!
//! Two independent processes share nothing but a queue name and the envelope format:
//!
//! 1. **Publisher**: captures, compresses and publishes frames at a fixed rate.
//! 2. **Consumer**: receives envelopes under a prefetch bound, decodes them and hands them to a
//!    sink, acknowledging automatically or after the sink succeeds.
//!
//! Failures are contained per delivery on the consumer side; only loss of the broker stops
//! either loop. Both sides close their broker connection exactly once on every exit path.
//!
//! # Module Structure
//!
//! - `envelope`: wire codec (JSON, base64 JPEG payload)
//! - `frame`: RGB rasters and their JPEG form
//! - `ingest`: frame sources for the publisher
//! - `publisher` / `consumer`: the two loops
//! - `sink`: downstream frame consumers
//! - `transport`: broker abstraction, MQTT v5 connection, in-memory broker
//! - `shutdown`: cooperative cancellation token
//! - `config`: file and environment configuration
//! - `error`: error taxonomy and dispositions

pub mod config;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod publisher;
pub mod shutdown;
pub mod sink;
pub mod transport;

pub use consumer::{
    ConsumerMonitor, ConsumerReport, ConsumerSettings, ConsumerState, DeliveryContext,
    FrameConsumer, Payload, Resolution, ShutdownPolicy,
};
pub use envelope::{decode, encode, EnvelopeError, EnvelopeMetadata, FrameEnvelope};
pub use error::{BridgeError, Disposition, ErrorKind};
pub use frame::Frame;
pub use ingest::{open_source, FrameSource, SourceConfig};
pub use publisher::{FramePublisher, PublisherReport, PublisherSettings};
pub use shutdown::Shutdown;
pub use sink::{build_sink, FrameSink, LogSink, MotionSink, SinkKind, SnapshotSink};
pub use transport::{
    AckHandle, AckMode, Broker, BrokerLease, BrokerObserver, Delivery, FlowControl, InMemoryBroker,
    MqttBroker,
};
