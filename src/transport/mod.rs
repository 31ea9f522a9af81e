//! Broker transport.
//!
//! The publisher and consumer talk to the broker only through the [`Broker`] trait:
//! - `MqttBroker`: MQTT v5 via rumqttc (QoS 1, receive-maximum flow control, manual acks)
//! - `InMemoryBroker`: in-process test double that enforces prefetch and records what it did
//!
//! Endpoint parsing and TLS materials live in `tls`.

pub mod memory;
pub mod mqtt;
mod tls;

use std::str::FromStr;
use std::time::Duration;

use anyhow::anyhow;

use crate::error::Result;

pub use memory::{BrokerEvent, BrokerObserver, InMemoryBroker};
pub use mqtt::{BrokerSettings, MqttBroker};
pub use tls::{parse_broker_endpoint, BrokerEndpoint, TlsMaterials};

/// When a delivery counts as consumed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AckMode {
    /// Settled by the broker client on receipt, before processing. At-most-once effort.
    #[default]
    Auto,
    /// Settled by the consumer after the sink has handled it. At-least-once.
    Manual,
}

impl FromStr for AckMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "manual" => Ok(Self::Manual),
            other => Err(anyhow!(
                "unknown ack mode '{}': expected 'auto' or 'manual'",
                other
            )),
        }
    }
}

impl std::fmt::Display for AckMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Subscription flow-control contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlowControl {
    /// Maximum delivered-but-unacknowledged messages. Only binding with `AckMode::Manual`.
    pub prefetch: u16,
    pub ack_mode: AckMode,
}

impl Default for FlowControl {
    fn default() -> Self {
        Self {
            prefetch: 1,
            ack_mode: AckMode::Auto,
        }
    }
}

/// Broker-side settlement of one delivery.
pub trait Acknowledge: Send {
    fn ack(self: Box<Self>) -> Result<()>;

    /// Settle without processing. Brokers without requeue semantics treat this as a discard.
    fn reject(self: Box<Self>) -> Result<()>;
}

/// Settlement handle for one delivery. Resolved exactly once: `ack` and `reject` consume the
/// handle, and a handle dropped unresolved is rejected.
pub struct AckHandle {
    tag: u64,
    inner: Option<Box<dyn Acknowledge>>,
}

impl AckHandle {
    pub fn new(tag: u64, inner: Box<dyn Acknowledge>) -> Self {
        Self {
            tag,
            inner: Some(inner),
        }
    }

    /// Handle for a delivery the broker already considers consumed (auto-ack).
    pub fn settled(tag: u64) -> Self {
        Self { tag, inner: None }
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// True when resolving this handle sends anything to the broker.
    pub fn is_pending(&self) -> bool {
        self.inner.is_some()
    }

    pub fn ack(mut self) -> Result<()> {
        match self.inner.take() {
            Some(inner) => inner.ack(),
            None => Ok(()),
        }
    }

    pub fn reject(mut self) -> Result<()> {
        match self.inner.take() {
            Some(inner) => inner.reject(),
            None => Ok(()),
        }
    }
}

impl Drop for AckHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            log::warn!("delivery tag={} dropped unresolved, rejecting", self.tag);
            if let Err(e) = inner.reject() {
                log::warn!("reject of tag={} failed: {}", self.tag, e);
            }
        }
    }
}

impl std::fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckHandle")
            .field("tag", &self.tag)
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// One message handed over by the broker.
#[derive(Debug)]
pub struct Delivery {
    pub tag: u64,
    pub body: Vec<u8>,
    pub ack: AckHandle,
}

/// A live connection to a broker. Exclusively owned by whichever side opened it.
pub trait Broker: Send {
    /// Ensure the named queue exists. Idempotent.
    fn declare_queue(&mut self, queue: &str) -> Result<()>;

    /// Hand one message to the broker. Does not wait for any consumer.
    fn publish(&mut self, queue: &str, body: Vec<u8>) -> Result<()>;

    fn subscribe(&mut self, queue: &str, flow: FlowControl) -> Result<()>;

    /// Wait up to `timeout` for the next delivery. `Ok(None)` means nothing arrived.
    fn next_delivery(&mut self, timeout: Duration) -> Result<Option<Delivery>>;

    /// Release the connection. Idempotent, and safe on a connection that already failed.
    fn close(&mut self) -> Result<()>;
}

/// Validates a queue name for use as an MQTT topic.
pub fn validate_queue_name(queue: &str) -> Result<()> {
    use crate::error::BridgeError;

    if queue.trim().is_empty() {
        return Err(BridgeError::Config("queue name is empty".to_string()));
    }
    if queue.contains(['+', '#']) {
        return Err(BridgeError::Config(format!(
            "queue name '{}' must not contain MQTT wildcards",
            queue
        )));
    }
    if queue.len() > u16::MAX as usize {
        return Err(BridgeError::Config("queue name is too long".to_string()));
    }
    Ok(())
}

/// Scoped ownership of a broker connection. The connection is closed when the lease is
/// dropped, whichever way its owner exits.
pub struct BrokerLease<B: Broker> {
    broker: B,
    released: bool,
}

impl<B: Broker> BrokerLease<B> {
    pub fn new(broker: B) -> Self {
        Self {
            broker,
            released: false,
        }
    }

    pub fn get(&mut self) -> &mut B {
        &mut self.broker
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Close now. Later calls, including the one from `Drop`, do nothing.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.broker.close()
    }
}

impl<B: Broker> Drop for BrokerLease<B> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("broker close failed: {}", e);
        }
    }
}
