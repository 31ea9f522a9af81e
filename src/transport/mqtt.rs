//! MQTT v5 broker connection.
//!
//! Queue semantics on top of MQTT:
//! - a queue is a topic, and every message travels at QoS 1
//! - consumers subscribe through a shared subscription (`$share/<group>/<queue>`), so each
//!   message goes to one member of the group
//! - prefetch is the client's Receive Maximum, so the broker keeps at most that many
//!   unacknowledged publishes in flight towards us
//! - manual acks hold back the PUBACK until the consumer resolves the delivery
//! - a reject is a PUBACK after logging; MQTT has no negative acknowledgement
//!
//! A background thread drives the rumqttc event loop and forwards what matters over a
//! channel. Receive Maximum bounds how many publishes can pile up there.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rumqttc::v5::mqttbytes::v5::{ConnectProperties, ConnectReturnCode, Packet, Publish};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{Client, Connection, Event, MqttOptions};

use super::tls::{parse_broker_endpoint, BrokerEndpoint, TlsMaterials};
use super::{validate_queue_name, AckHandle, AckMode, Acknowledge, Broker, Delivery, FlowControl};
use crate::error::{BridgeError, Result};

/// Largest packet we accept from the broker. A 1080p JPEG in base64 fits comfortably.
pub const MAX_PACKET_BYTES: u32 = 16 * 1024 * 1024;
const REQUEST_CAPACITY: usize = 10;
const CLOSE_POLL: Duration = Duration::from_millis(20);

/// Connection parameters.
#[derive(Clone, Debug)]
pub struct BrokerSettings {
    pub addr: String,
    pub use_tls: bool,
    pub ca_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    /// Keep the broker-side session (subscription and queued QoS 1 messages) for this many
    /// seconds after a disconnect. `None` starts clean every time.
    pub session_expiry_secs: Option<u32>,
    /// CONNECT Receive Maximum: unacknowledged QoS 1 publishes the broker may have in flight
    /// towards this client. Consumers set it to their prefetch.
    pub receive_maximum: Option<u16>,
    /// Shared subscription group. Consumers in one group split the queue between them; `None`
    /// subscribes to the plain topic and receives every message.
    pub share_group: Option<String>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:1883".to_string(),
            use_tls: false,
            ca_path: None,
            client_cert_path: None,
            client_key_path: None,
            username: None,
            password: None,
            client_id: format!("frame-bridge-{}", std::process::id()),
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            session_expiry_secs: None,
            receive_maximum: None,
            share_group: None,
        }
    }
}

pub fn validate_share_group(group: &str) -> Result<()> {
    if group.is_empty() || group.contains(['/', '+', '#']) {
        return Err(BridgeError::Config(format!(
            "share group '{}' must be non-empty and free of '/', '+' and '#'",
            group
        )));
    }
    Ok(())
}

/// Topic filter a consumer subscribes with.
pub fn subscription_filter(share_group: Option<&str>, queue: &str) -> Result<String> {
    match share_group {
        None => Ok(queue.to_string()),
        Some(group) => {
            validate_share_group(group)?;
            Ok(format!("$share/{}/{}", group, queue))
        }
    }
}

enum LinkEvent {
    Connected,
    SubAck,
    Publish(Publish),
    Lost(String),
}

pub struct MqttBroker {
    client: Client,
    endpoint: BrokerEndpoint,
    events: Option<Receiver<LinkEvent>>,
    link: Option<JoinHandle<()>>,
    lost: Arc<Mutex<Option<String>>>,
    closing: Arc<AtomicBool>,
    declared: HashSet<String>,
    subscription: Option<FlowControl>,
    share_group: Option<String>,
    receive_maximum: Option<u16>,
    next_tag: u64,
    connect_timeout: Duration,
    closed: bool,
}

impl MqttBroker {
    /// Connect and wait for the broker's CONNACK.
    pub fn connect(settings: &BrokerSettings) -> Result<Self> {
        let endpoint = parse_broker_endpoint(&settings.addr, settings.use_tls)
            .map_err(|e| BridgeError::Config(format!("{:#}", e)))?;
        let tls = TlsMaterials::load(
            settings.ca_path.as_ref(),
            settings.client_cert_path.as_ref(),
            settings.client_key_path.as_ref(),
        )
        .map_err(|e| BridgeError::Config(format!("{:#}", e)))?;
        let transport = tls
            .build_transport(&endpoint)
            .map_err(|e| BridgeError::Config(format!("{:#}", e)))?;

        if settings.receive_maximum == Some(0) {
            return Err(BridgeError::Config(
                "receive maximum must be at least 1".to_string(),
            ));
        }
        if let Some(group) = settings.share_group.as_deref() {
            validate_share_group(group)?;
        }

        let mut options = MqttOptions::new(&settings.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(settings.keep_alive);
        options.set_clean_start(settings.session_expiry_secs.is_none());
        let mut properties = ConnectProperties::new();
        properties.session_expiry_interval = settings.session_expiry_secs;
        properties.receive_maximum = settings.receive_maximum;
        options.set_connect_properties(properties);
        // Shares the connect properties set above, so it goes after them.
        options.set_max_packet_size(Some(MAX_PACKET_BYTES));
        options.set_manual_acks(true);
        if let Some(user) = &settings.username {
            options.set_credentials(user, settings.password.clone().unwrap_or_default());
        }
        options.set_transport(transport);

        Self::start(options, endpoint, settings)
    }

    fn start(
        options: MqttOptions,
        endpoint: BrokerEndpoint,
        settings: &BrokerSettings,
    ) -> Result<Self> {
        let timeout = settings.connect_timeout;
        let (client, connection) = Client::new(options, REQUEST_CAPACITY);
        let (tx, rx) = mpsc::channel();
        let lost = Arc::new(Mutex::new(None));
        let closing = Arc::new(AtomicBool::new(false));
        let link = {
            let lost = lost.clone();
            let closing = closing.clone();
            std::thread::Builder::new()
                .name("mqtt-link".to_string())
                .spawn(move || drive_link(connection, tx, lost, closing))
                .map_err(|e| BridgeError::BrokerConnection(format!("spawn link thread: {}", e)))?
        };

        let mut broker = Self {
            client,
            endpoint,
            events: Some(rx),
            link: Some(link),
            lost,
            closing,
            declared: HashSet::new(),
            subscription: None,
            share_group: settings.share_group.clone(),
            receive_maximum: settings.receive_maximum,
            next_tag: 0,
            connect_timeout: timeout,
            closed: false,
        };

        match broker.wait_for(timeout, |event| matches!(event, LinkEvent::Connected)) {
            Ok(()) => {
                log::info!("connected to broker {}", broker.endpoint);
                Ok(broker)
            }
            Err(e) => {
                let _ = broker.close();
                Err(e)
            }
        }
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    fn check_link(&self) -> Result<()> {
        if self.closed {
            return Err(BridgeError::BrokerConnection(
                "connection is closed".to_string(),
            ));
        }
        let lost = match self.lost.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        match lost {
            Some(reason) => Err(BridgeError::BrokerConnection(reason)),
            None => Ok(()),
        }
    }

    /// Consume link events until one satisfies `done`. Publishes that arrive meanwhile are
    /// settled so the broker's window does not stall.
    fn wait_for(&self, timeout: Duration, done: impl Fn(&LinkEvent) -> bool) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let client = self.client.clone();
        let events = self
            .events
            .as_ref()
            .ok_or_else(|| BridgeError::BrokerConnection("connection is closed".to_string()))?;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match events.recv_timeout(remaining) {
                Ok(LinkEvent::Lost(reason)) => return Err(BridgeError::BrokerConnection(reason)),
                Ok(event) if done(&event) => return Ok(()),
                Ok(LinkEvent::Publish(publish)) => {
                    log::warn!("unexpected publish on {:?} before subscribe", publish.topic);
                    let _ = client.ack(&publish);
                }
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => {
                    return Err(BridgeError::BrokerConnection(format!(
                        "no answer from {} within {:?}",
                        self.endpoint, timeout
                    )))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(BridgeError::BrokerConnection(
                        "broker link stopped".to_string(),
                    ))
                }
            }
        }
    }
}

fn drive_link(
    mut connection: Connection,
    tx: Sender<LinkEvent>,
    lost: Arc<Mutex<Option<String>>>,
    closing: Arc<AtomicBool>,
) {
    for event in connection.iter() {
        let forward = match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    LinkEvent::Connected
                } else {
                    LinkEvent::Lost(format!("broker refused connection: {:?}", ack.code))
                }
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => LinkEvent::SubAck,
            Ok(Event::Incoming(Packet::Publish(publish))) => LinkEvent::Publish(publish),
            Ok(Event::Incoming(Packet::Disconnect(d))) => {
                LinkEvent::Lost(format!("broker disconnected: {:?}", d.reason_code))
            }
            Ok(_) => continue,
            Err(e) => LinkEvent::Lost(e.to_string()),
        };

        let is_lost = matches!(forward, LinkEvent::Lost(_));
        if let LinkEvent::Lost(reason) = &forward {
            if closing.load(Ordering::SeqCst) {
                log::debug!("MQTT link ended during close: {}", reason);
            } else {
                log::warn!("MQTT connection error: {}", reason);
            }
            match lost.lock() {
                Ok(mut guard) => *guard = Some(reason.clone()),
                Err(poisoned) => *poisoned.into_inner() = Some(reason.clone()),
            }
        }
        if tx.send(forward).is_err() || is_lost {
            break;
        }
    }
}

impl Broker for MqttBroker {
    fn declare_queue(&mut self, queue: &str) -> Result<()> {
        validate_queue_name(queue)?;
        self.check_link()?;
        if self.declared.insert(queue.to_string()) {
            log::debug!("queue {} ready on {}", queue, self.endpoint);
        }
        Ok(())
    }

    fn publish(&mut self, queue: &str, body: Vec<u8>) -> Result<()> {
        self.check_link()?;
        self.client
            .publish(queue, QoS::AtLeastOnce, false, body)
            .map_err(|e| BridgeError::BrokerConnection(format!("publish to {}: {}", queue, e)))
    }

    fn subscribe(&mut self, queue: &str, flow: FlowControl) -> Result<()> {
        validate_queue_name(queue)?;
        if flow.prefetch == 0 {
            return Err(BridgeError::Config("prefetch must be at least 1".to_string()));
        }
        if self.receive_maximum != Some(flow.prefetch) {
            log::warn!(
                "prefetch {} differs from the connection's receive maximum {:?}; the broker applies the latter",
                flow.prefetch,
                self.receive_maximum
            );
        }
        let filter = subscription_filter(self.share_group.as_deref(), queue)?;
        self.check_link()?;
        self.client
            .subscribe(filter.as_str(), QoS::AtLeastOnce)
            .map_err(|e| BridgeError::BrokerConnection(format!("subscribe {}: {}", filter, e)))?;
        self.wait_for(self.connect_timeout, |event| {
            matches!(event, LinkEvent::SubAck)
        })?;
        self.subscription = Some(flow);
        log::info!(
            "subscribed to {} (prefetch={}, ack={})",
            filter,
            flow.prefetch,
            flow.ack_mode
        );
        Ok(())
    }

    fn next_delivery(&mut self, timeout: Duration) -> Result<Option<Delivery>> {
        let flow = self.subscription.ok_or_else(|| {
            BridgeError::BrokerConnection("next_delivery called without a subscription".to_string())
        })?;
        let events = self
            .events
            .as_ref()
            .ok_or_else(|| BridgeError::BrokerConnection("connection is closed".to_string()))?;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match events.recv_timeout(remaining) {
                Ok(LinkEvent::Publish(publish)) => {
                    self.next_tag += 1;
                    let tag = self.next_tag;
                    let body = publish.payload.to_vec();
                    let ack = match flow.ack_mode {
                        AckMode::Auto => {
                            self.client.ack(&publish).map_err(|e| {
                                BridgeError::BrokerConnection(format!("ack: {}", e))
                            })?;
                            AckHandle::settled(tag)
                        }
                        AckMode::Manual => AckHandle::new(
                            tag,
                            Box::new(MqttAck {
                                client: self.client.clone(),
                                publish,
                                tag,
                            }),
                        ),
                    };
                    return Ok(Some(Delivery { tag, body, ack }));
                }
                Ok(LinkEvent::Lost(reason)) => return Err(BridgeError::BrokerConnection(reason)),
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(BridgeError::BrokerConnection(
                        "broker link stopped".to_string(),
                    ))
                }
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.closing.store(true, Ordering::SeqCst);
        if let Err(e) = self.client.disconnect() {
            log::debug!("disconnect request failed: {}", e);
        }
        self.events = None;

        if let Some(handle) = self.link.take() {
            let deadline = Instant::now() + self.connect_timeout;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(CLOSE_POLL);
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                log::warn!(
                    "MQTT link to {} did not stop within {:?}; detaching",
                    self.endpoint,
                    self.connect_timeout
                );
            }
        }
        log::info!("disconnected from broker {}", self.endpoint);
        Ok(())
    }
}

struct MqttAck {
    client: Client,
    publish: Publish,
    tag: u64,
}

impl Acknowledge for MqttAck {
    fn ack(self: Box<Self>) -> Result<()> {
        self.client
            .ack(&self.publish)
            .map_err(|e| BridgeError::BrokerConnection(format!("ack tag={}: {}", self.tag, e)))
    }

    fn reject(self: Box<Self>) -> Result<()> {
        log::debug!("rejecting tag={} (settled without processing)", self.tag);
        self.client
            .ack(&self.publish)
            .map_err(|e| BridgeError::BrokerConnection(format!("reject tag={}: {}", self.tag, e)))
    }
}
