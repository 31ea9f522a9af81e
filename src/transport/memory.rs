//! In-process broker.
//!
//! Every handle obtained through [`InMemoryBroker::connect`] is a separate connection onto the
//! same set of queues. Queues are durable: messages published before anyone subscribes wait
//! in the queue. Manual-ack subscriptions never hold more than `prefetch` unacknowledged
//! deliveries, and closing a connection puts its unacknowledged deliveries back at the head of
//! their queue. A reject discards the message.
//!
//! [`BrokerObserver`] observes the shared state from tests without holding a connection.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{validate_queue_name, AckHandle, AckMode, Acknowledge, Broker, Delivery, FlowControl};
use crate::error::{BridgeError, Result};

/// What the broker did, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BrokerEvent {
    Declared(String),
    Published(u64),
    Delivered(u64),
    Acked(u64),
    Rejected(u64),
    Requeued(u64),
    Closed(u64),
}

struct Message {
    tag: u64,
    body: Vec<u8>,
}

struct Unacked {
    connection: u64,
    queue: String,
    body: Vec<u8>,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, VecDeque<Message>>,
    declared: HashSet<String>,
    unacked: BTreeMap<u64, Unacked>,
    next_tag: u64,
    next_connection: u64,
    peak_outstanding: usize,
    events: Vec<BrokerEvent>,
    close_calls: usize,
    severed: bool,
    fail_publish: bool,
}

impl State {
    fn outstanding_for(&self, connection: u64) -> usize {
        self.unacked
            .values()
            .filter(|u| u.connection == connection)
            .count()
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    cv: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

pub struct InMemoryBroker {
    shared: Arc<Shared>,
    connection: u64,
    subscription: Option<(String, FlowControl)>,
    closed: bool,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::attach(Arc::new(Shared::default()))
    }

    /// Open another connection to the same broker.
    pub fn connect(&self) -> Self {
        Self::attach(self.shared.clone())
    }

    pub fn observer(&self) -> BrokerObserver {
        BrokerObserver {
            shared: self.shared.clone(),
        }
    }

    fn attach(shared: Arc<Shared>) -> Self {
        let connection = {
            let mut state = shared.lock();
            state.next_connection += 1;
            state.next_connection
        };
        Self {
            shared,
            connection,
            subscription: None,
            closed: false,
        }
    }

    fn ensure_open(&self, state: &State) -> Result<()> {
        if self.closed {
            return Err(BridgeError::BrokerConnection(
                "connection is closed".to_string(),
            ));
        }
        if state.severed {
            return Err(BridgeError::BrokerConnection(
                "connection lost".to_string(),
            ));
        }
        Ok(())
    }
}

impl Broker for InMemoryBroker {
    fn declare_queue(&mut self, queue: &str) -> Result<()> {
        validate_queue_name(queue)?;
        let mut state = self.shared.lock();
        self.ensure_open(&state)?;
        if state.declared.insert(queue.to_string()) {
            state.queues.entry(queue.to_string()).or_default();
            state.events.push(BrokerEvent::Declared(queue.to_string()));
        }
        Ok(())
    }

    fn publish(&mut self, queue: &str, body: Vec<u8>) -> Result<()> {
        validate_queue_name(queue)?;
        let mut state = self.shared.lock();
        self.ensure_open(&state)?;
        if state.fail_publish {
            return Err(BridgeError::BrokerConnection(
                "publish refused by broker".to_string(),
            ));
        }
        state.next_tag += 1;
        let tag = state.next_tag;
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(Message { tag, body });
        state.events.push(BrokerEvent::Published(tag));
        self.shared.cv.notify_all();
        Ok(())
    }

    fn subscribe(&mut self, queue: &str, flow: FlowControl) -> Result<()> {
        validate_queue_name(queue)?;
        if flow.prefetch == 0 {
            return Err(BridgeError::Config("prefetch must be at least 1".to_string()));
        }
        let mut state = self.shared.lock();
        self.ensure_open(&state)?;
        state.queues.entry(queue.to_string()).or_default();
        self.subscription = Some((queue.to_string(), flow));
        Ok(())
    }

    fn next_delivery(&mut self, timeout: Duration) -> Result<Option<Delivery>> {
        let (queue, flow) = match &self.subscription {
            Some(sub) => sub.clone(),
            None => {
                return Err(BridgeError::BrokerConnection(
                    "next_delivery called without a subscription".to_string(),
                ))
            }
        };
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        loop {
            self.ensure_open(&state)?;

            let window_open = flow.ack_mode == AckMode::Auto
                || state.outstanding_for(self.connection) < flow.prefetch as usize;
            if window_open {
                if let Some(message) = state.queues.get_mut(&queue).and_then(|q| q.pop_front()) {
                    state.events.push(BrokerEvent::Delivered(message.tag));
                    let ack = match flow.ack_mode {
                        AckMode::Auto => AckHandle::settled(message.tag),
                        AckMode::Manual => {
                            state.unacked.insert(
                                message.tag,
                                Unacked {
                                    connection: self.connection,
                                    queue: queue.clone(),
                                    body: message.body.clone(),
                                },
                            );
                            let outstanding = state.outstanding_for(self.connection);
                            state.peak_outstanding = state.peak_outstanding.max(outstanding);
                            AckHandle::new(
                                message.tag,
                                Box::new(MemoryAck {
                                    shared: self.shared.clone(),
                                    connection: self.connection,
                                    tag: message.tag,
                                }),
                            )
                        }
                    };
                    return Ok(Some(Delivery {
                        tag: message.tag,
                        body: message.body,
                        ack,
                    }));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            state = match self.shared.cv.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.shared.lock();
        state.close_calls += 1;
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.subscription = None;

        let mine: Vec<u64> = state
            .unacked
            .iter()
            .filter(|(_, u)| u.connection == self.connection)
            .map(|(tag, _)| *tag)
            .collect();
        // Reverse so the oldest unacked delivery ends up first in line.
        for tag in mine.into_iter().rev() {
            if let Some(u) = state.unacked.remove(&tag) {
                state
                    .queues
                    .entry(u.queue)
                    .or_default()
                    .push_front(Message { tag, body: u.body });
                state.events.push(BrokerEvent::Requeued(tag));
            }
        }
        state.events.push(BrokerEvent::Closed(self.connection));
        self.shared.cv.notify_all();
        Ok(())
    }
}

/// Settles one delivery on the connection it was handed to. After a requeue the same tag may
/// be outstanding on another connection; this handle no longer owns it then.
struct MemoryAck {
    shared: Arc<Shared>,
    connection: u64,
    tag: u64,
}

impl MemoryAck {
    fn settle(self, event: BrokerEvent) -> Result<()> {
        let mut state = self.shared.lock();
        if state.severed {
            return Err(BridgeError::BrokerConnection(
                "connection lost".to_string(),
            ));
        }
        let owned = state
            .unacked
            .get(&self.tag)
            .is_some_and(|u| u.connection == self.connection);
        if !owned {
            return Err(BridgeError::BrokerConnection(format!(
                "delivery tag {} is no longer outstanding on connection {}",
                self.tag, self.connection
            )));
        }
        state.unacked.remove(&self.tag);
        state.events.push(event);
        self.shared.cv.notify_all();
        Ok(())
    }
}

impl Acknowledge for MemoryAck {
    fn ack(self: Box<Self>) -> Result<()> {
        let tag = self.tag;
        self.settle(BrokerEvent::Acked(tag))
    }

    fn reject(self: Box<Self>) -> Result<()> {
        let tag = self.tag;
        self.settle(BrokerEvent::Rejected(tag))
    }
}

/// Read-only view of an [`InMemoryBroker`], plus fault injection.
#[derive(Clone)]
pub struct BrokerObserver {
    shared: Arc<Shared>,
}

impl BrokerObserver {
    pub fn events(&self) -> Vec<BrokerEvent> {
        self.shared.lock().events.clone()
    }

    fn tags(&self, pick: fn(&BrokerEvent) -> Option<u64>) -> Vec<u64> {
        self.shared.lock().events.iter().filter_map(pick).collect()
    }

    pub fn published(&self) -> Vec<u64> {
        self.tags(|e| match e {
            BrokerEvent::Published(t) => Some(*t),
            _ => None,
        })
    }

    pub fn delivered(&self) -> Vec<u64> {
        self.tags(|e| match e {
            BrokerEvent::Delivered(t) => Some(*t),
            _ => None,
        })
    }

    pub fn acked(&self) -> Vec<u64> {
        self.tags(|e| match e {
            BrokerEvent::Acked(t) => Some(*t),
            _ => None,
        })
    }

    pub fn rejected(&self) -> Vec<u64> {
        self.tags(|e| match e {
            BrokerEvent::Rejected(t) => Some(*t),
            _ => None,
        })
    }

    /// Messages waiting in `queue`, not counting unacknowledged deliveries.
    pub fn depth(&self, queue: &str) -> usize {
        self.shared.lock().queues.get(queue).map_or(0, |q| q.len())
    }

    pub fn is_declared(&self, queue: &str) -> bool {
        self.shared.lock().declared.contains(queue)
    }

    /// Delivered but neither acked nor rejected, across all connections.
    pub fn outstanding(&self) -> usize {
        self.shared.lock().unacked.len()
    }

    /// Highest number of unacknowledged deliveries any single connection has held.
    pub fn peak_outstanding(&self) -> usize {
        self.shared.lock().peak_outstanding
    }

    /// Number of `close` calls, including repeats on an already closed connection.
    pub fn close_calls(&self) -> usize {
        self.shared.lock().close_calls
    }

    /// Connections that actually went from open to closed.
    pub fn closed_connections(&self) -> usize {
        self.shared
            .lock()
            .events
            .iter()
            .filter(|e| matches!(e, BrokerEvent::Closed(_)))
            .count()
    }

    /// Simulate the network dropping: every connection fails from now on.
    pub fn sever(&self) {
        self.shared.lock().severed = true;
        self.shared.cv.notify_all();
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.shared.lock().fail_publish = fail;
    }

    /// Block until `count` messages have been published, or `timeout` passes.
    pub fn wait_for_published(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        loop {
            let published = state
                .events
                .iter()
                .filter(|e| matches!(e, BrokerEvent::Published(_)))
                .count();
            if published >= count {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = match self.shared.cv.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}
