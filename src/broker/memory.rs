//! In-process broker.
//!
//! Implements the `broker` traits without a network: queues, direct-exchange
//! bindings, per-channel delivery tags, prefetch, ack/nack with requeue,
//! publisher confirms and heartbeat deadlines. Every broker created through one
//! `MemoryConnector` appends to a shared journal, so the order of events across
//! the upstream and downstream brokers can be inspected afterwards.
//!
//! Concurrency notes:
//! - All broker state sits behind one `std::sync::Mutex`; it is never held
//!   across an `.await`.
//! - Deliveries are pushed: as soon as a registered consumer has prefetch
//!   room, the next ready message becomes unacked and lands in that consumer's
//!   buffer, whether or not the client is polling its stream yet.
//! - Consumers park on a `watch` channel that is bumped on every state change.
//! - Connection liveness is evaluated lazily: a connection whose heartbeat
//!   deadline passed is closed the next time anything looks at it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, stream};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{
    Channel, Connection, ConnectionState, Connector, Delivery, DeliveryStream, DeliveryTag,
};
use crate::config::ConnectionSettings;
use crate::utils::{BridgeError, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Something that happened on a broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    ConnectionOpened {
        connection: u64,
    },
    ConnectionClosed {
        connection: u64,
        reason: String,
    },
    Delivered {
        queue: String,
        tag: DeliveryTag,
        body: Vec<u8>,
    },
    Acked {
        tag: DeliveryTag,
    },
    Nacked {
        tag: DeliveryTag,
        requeue: bool,
    },
    /// `task` is the tokio task that performed the write.
    Published {
        exchange: String,
        routing_key: String,
        body: Vec<u8>,
        task: Option<tokio::task::Id>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub broker: String,
    pub event: BrokerEvent,
}

#[derive(Debug, Clone, Default)]
struct Journal(Arc<Mutex<Vec<JournalEntry>>>);

impl Journal {
    fn record(&self, broker: &str, event: BrokerEvent) {
        lock(&self.0).push(JournalEntry {
            broker: broker.to_string(),
            event,
        });
    }

    fn snapshot(&self) -> Vec<JournalEntry> {
        lock(&self.0).clone()
    }
}

/// Routes `connect` calls to in-memory brokers by host name.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    brokers: Arc<Mutex<HashMap<String, MemoryBroker>>>,
    journal: Journal,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a broker reachable as `host`.
    pub fn add_broker(&self, host: &str) -> MemoryBroker {
        let broker = MemoryBroker::new(host, self.journal.clone());
        lock(&self.brokers).insert(host.to_string(), broker.clone());
        broker
    }

    /// Events of every broker of this connector, oldest first.
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.journal.snapshot()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    async fn connect(&self, settings: &ConnectionSettings) -> Result<MemoryConnection> {
        let broker = lock(&self.brokers)
            .get(&settings.host)
            .cloned()
            .ok_or_else(|| BridgeError::ConnectionRefused(settings.host.clone()))?;
        Ok(broker.open_connection(settings.heartbeat()))
    }
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    body: Vec<u8>,
    exchange: String,
    routing_key: String,
    redelivered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct DeliveryKey {
    connection: u64,
    channel: u64,
    tag: u64,
}

#[derive(Debug, Default)]
struct Queue {
    ready: VecDeque<QueuedMessage>,
    unacked: HashMap<DeliveryKey, QueuedMessage>,
}

#[derive(Debug)]
struct Binding {
    queue: String,
    routing_key: String,
}

/// A `basic_consume` registration.
#[derive(Debug)]
struct ConsumerSlot {
    connection: u64,
    channel: u64,
    queue: String,
    next_tag: Arc<AtomicU64>,
    prefetch: Arc<AtomicU16>,
    outbox: Arc<Mutex<VecDeque<Delivery>>>,
}

impl ConsumerSlot {
    fn has_room(&self, queue: &Queue) -> bool {
        let prefetch = self.prefetch.load(Ordering::Acquire);
        prefetch == 0
            || queue
                .unacked
                .keys()
                .filter(|key| key.connection == self.connection && key.channel == self.channel)
                .count()
                < usize::from(prefetch)
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, Queue>,
    exchanges: HashMap<String, Vec<Binding>>,
    connections: HashMap<u64, Arc<ConnectionCore>>,
    consumers: Vec<ConsumerSlot>,
    next_connection_id: u64,
    nack_publishes: bool,
}

/// A single in-memory broker.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    name: String,
    state: Arc<Mutex<BrokerState>>,
    changes: Arc<watch::Sender<u64>>,
    journal: Journal,
}

impl MemoryBroker {
    fn new(name: &str, journal: Journal) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(BrokerState::default())),
            changes: Arc::new(changes),
            journal,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn declare_queue(&self, queue: &str) {
        lock(&self.state)
            .queues
            .entry(queue.to_string())
            .or_default();
    }

    pub fn declare_exchange(&self, exchange: &str) {
        lock(&self.state)
            .exchanges
            .entry(exchange.to_string())
            .or_default();
    }

    /// Direct binding: messages published to `exchange` with exactly
    /// `routing_key` land in `queue`. Declares both if needed.
    pub fn bind(&self, queue: &str, exchange: &str, routing_key: &str) {
        let mut state = lock(&self.state);
        state.queues.entry(queue.to_string()).or_default();
        state
            .exchanges
            .entry(exchange.to_string())
            .or_default()
            .push(Binding {
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            });
    }

    /// Appends a message to `queue` as if published through the default exchange.
    pub fn post(&self, queue: &str, body: impl Into<Vec<u8>>) {
        let mut state = lock(&self.state);
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(QueuedMessage {
                body: body.into(),
                exchange: String::new(),
                routing_key: queue.to_string(),
                redelivered: false,
            });
        self.dispatch(&mut state);
        drop(state);
        self.bump();
    }

    /// Bodies waiting in `queue`, in delivery order.
    pub fn ready_messages(&self, queue: &str) -> Vec<Vec<u8>> {
        lock(&self.state)
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map(|q| q.unacked.len())
            .unwrap_or_default()
    }

    pub fn open_connections(&self) -> usize {
        lock(&self.state).connections.len()
    }

    /// When set, publishes on confirm-mode channels are negatively confirmed
    /// and dropped.
    pub fn set_nack_publishes(&self, nack: bool) {
        lock(&self.state).nack_publishes = nack;
    }

    /// Force-closes every open connection, as a broker restart would.
    pub fn kill_connections(&self, reason: &str) {
        let connections: Vec<_> = lock(&self.state).connections.values().cloned().collect();
        for core in connections {
            self.close_connection(&core, reason);
        }
    }

    /// Ticks on every state change of this broker.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn bump(&self) {
        self.changes.send_modify(|version| *version = version.wrapping_add(1));
    }

    fn open_connection(&self, heartbeat: Option<Duration>) -> MemoryConnection {
        let mut state = lock(&self.state);
        state.next_connection_id += 1;
        let id = state.next_connection_id;
        let core = Arc::new(ConnectionCore::new(id, heartbeat));
        state.connections.insert(id, core.clone());
        self.journal
            .record(&self.name, BrokerEvent::ConnectionOpened { connection: id });
        drop(state);

        debug!(broker = %self.name, connection = id, "connection opened");
        MemoryConnection {
            broker: self.clone(),
            core,
            next_channel: AtomicU64::new(1),
        }
    }

    /// Marks the connection closed and hands its unacknowledged deliveries back
    /// to their queues. Does nothing if it is already closed.
    fn close_connection(&self, core: &ConnectionCore, reason: &str) {
        if !core.mark_closed(reason) {
            return;
        }

        let mut state = lock(&self.state);
        state.connections.remove(&core.id);
        state.consumers.retain(|slot| slot.connection != core.id);
        for queue in state.queues.values_mut() {
            let mut orphaned: Vec<_> = queue
                .unacked
                .iter()
                .filter(|(key, _)| key.connection == core.id)
                .map(|(key, _)| *key)
                .collect();
            // Newest first, so push_front restores the original order.
            orphaned.sort_by(|a, b| b.tag.cmp(&a.tag));
            for key in orphaned {
                if let Some(mut message) = queue.unacked.remove(&key) {
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
            }
        }
        self.journal.record(
            &self.name,
            BrokerEvent::ConnectionClosed {
                connection: core.id,
                reason: reason.to_string(),
            },
        );
        self.dispatch(&mut state);
        drop(state);

        debug!(broker = %self.name, connection = core.id, reason, "connection closed");
        self.bump();
    }

    /// Applies the heartbeat deadline, then reports whether the connection is usable.
    fn liveness(&self, core: &ConnectionCore) -> Result<()> {
        if core.expired(Instant::now()) {
            warn!(
                broker = %self.name,
                connection = core.id,
                "missed heartbeats from client, closing connection"
            );
            self.close_connection(core, "missed heartbeats from client, timeout");
        }
        core.ensure_open()
    }

    /// Moves ready messages into the buffers of consumers with prefetch room.
    fn dispatch(&self, state: &mut BrokerState) {
        let BrokerState {
            queues, consumers, ..
        } = state;

        for slot in consumers.iter() {
            let Some(queue) = queues.get_mut(&slot.queue) else {
                continue;
            };
            while slot.has_room(queue) {
                let Some(message) = queue.ready.pop_front() else {
                    break;
                };
                let tag = slot.next_tag.fetch_add(1, Ordering::AcqRel);
                queue.unacked.insert(
                    DeliveryKey {
                        connection: slot.connection,
                        channel: slot.channel,
                        tag,
                    },
                    message.clone(),
                );
                self.journal.record(
                    &self.name,
                    BrokerEvent::Delivered {
                        queue: slot.queue.clone(),
                        tag: DeliveryTag(tag),
                        body: message.body.clone(),
                    },
                );
                lock(&slot.outbox).push_back(Delivery {
                    tag: DeliveryTag(tag),
                    body: message.body,
                    redelivered: message.redelivered,
                    exchange: message.exchange,
                    routing_key: message.routing_key,
                });
            }
        }
    }

    fn settle(&self, connection: u64, channel: u64, tag: DeliveryTag, outcome: Settle) -> Result<()> {
        let key = DeliveryKey {
            connection,
            channel,
            tag: tag.0,
        };

        let mut state = lock(&self.state);
        let queue = state
            .queues
            .values_mut()
            .find(|q| q.unacked.contains_key(&key))
            .ok_or_else(|| BridgeError::Channel {
                code: 406,
                text: format!("PRECONDITION_FAILED - unknown delivery tag {tag}"),
            })?;
        let Some(mut message) = queue.unacked.remove(&key) else {
            return Ok(());
        };

        let event = match outcome {
            Settle::Ack => BrokerEvent::Acked { tag },
            Settle::Nack { requeue } => {
                if requeue {
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
                BrokerEvent::Nacked { tag, requeue }
            }
        };
        self.journal.record(&self.name, event);
        self.dispatch(&mut state);
        drop(state);

        self.bump();
        Ok(())
    }

    fn publish(&self, exchange: &str, routing_key: &str, body: &[u8], confirm: bool) -> Result<()> {
        let mut state = lock(&self.state);

        let targets: Vec<String> = if exchange.is_empty() {
            if state.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            }
        } else {
            state
                .exchanges
                .get(exchange)
                .ok_or_else(|| BridgeError::Channel {
                    code: 404,
                    text: format!("NOT_FOUND - no exchange '{exchange}'"),
                })?
                .iter()
                .filter(|binding| binding.routing_key == routing_key)
                .map(|binding| binding.queue.clone())
                .collect()
        };

        if confirm && state.nack_publishes {
            return Err(BridgeError::PublishNotConfirmed {
                exchange: exchange.to_string(),
            });
        }

        for target in targets {
            if let Some(queue) = state.queues.get_mut(&target) {
                queue.ready.push_back(QueuedMessage {
                    body: body.to_vec(),
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    redelivered: false,
                });
            }
        }
        self.journal.record(
            &self.name,
            BrokerEvent::Published {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                body: body.to_vec(),
                task: tokio::task::try_id(),
            },
        );
        self.dispatch(&mut state);
        drop(state);

        self.bump();
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Settle {
    Ack,
    Nack { requeue: bool },
}

#[derive(Debug)]
struct Liveness {
    state: ConnectionState,
    last_serviced: Instant,
    heartbeats: u64,
    close_reason: Option<String>,
}

/// Connection state shared between the broker and the client handle.
#[derive(Debug)]
struct ConnectionCore {
    id: u64,
    heartbeat: Option<Duration>,
    liveness: Mutex<Liveness>,
}

impl ConnectionCore {
    /// Missing two heartbeats in a row is fatal.
    const MISSED_HEARTBEATS: u32 = 2;

    fn new(id: u64, heartbeat: Option<Duration>) -> Self {
        Self {
            id,
            heartbeat,
            liveness: Mutex::new(Liveness {
                state: ConnectionState::Open,
                last_serviced: Instant::now(),
                heartbeats: 0,
                close_reason: None,
            }),
        }
    }

    fn expired(&self, now: Instant) -> bool {
        let Some(heartbeat) = self.heartbeat else {
            return false;
        };
        let liveness = lock(&self.liveness);
        liveness.state == ConnectionState::Open
            && now.duration_since(liveness.last_serviced) > heartbeat * Self::MISSED_HEARTBEATS
    }

    fn ensure_open(&self) -> Result<()> {
        let liveness = lock(&self.liveness);
        match liveness.state {
            ConnectionState::Open => Ok(()),
            _ => Err(BridgeError::ConnectionClosed(
                liveness
                    .close_reason
                    .clone()
                    .unwrap_or_else(|| format!("connection is {:?}", liveness.state)),
            )),
        }
    }

    /// Any client traffic resets the broker's heartbeat timer.
    fn touch(&self) {
        lock(&self.liveness).last_serviced = Instant::now();
    }

    fn answer_heartbeat(&self) {
        let mut liveness = lock(&self.liveness);
        liveness.last_serviced = Instant::now();
        liveness.heartbeats += 1;
    }

    fn begin_close(&self) {
        let mut liveness = lock(&self.liveness);
        if liveness.state == ConnectionState::Open {
            liveness.state = ConnectionState::Closing;
        }
    }

    /// Returns false if the connection was already closed.
    fn mark_closed(&self, reason: &str) -> bool {
        let mut liveness = lock(&self.liveness);
        if liveness.state == ConnectionState::Closed {
            return false;
        }
        liveness.state = ConnectionState::Closed;
        liveness.close_reason = Some(reason.to_string());
        true
    }

    fn state(&self) -> ConnectionState {
        lock(&self.liveness).state
    }
}

/// Client side of an in-memory connection.
#[derive(Debug)]
pub struct MemoryConnection {
    broker: MemoryBroker,
    core: Arc<ConnectionCore>,
    next_channel: AtomicU64,
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.core.id
    }

    /// Number of `process_events` calls that answered the broker's heartbeat.
    pub fn heartbeats_answered(&self) -> u64 {
        lock(&self.core.liveness).heartbeats
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    type Channel = MemoryChannel;

    async fn open_channel(&self) -> Result<MemoryChannel> {
        self.broker.liveness(&self.core)?;
        self.core.touch();
        Ok(MemoryChannel {
            broker: self.broker.clone(),
            core: self.core.clone(),
            id: self.next_channel.fetch_add(1, Ordering::AcqRel),
            next_tag: Arc::new(AtomicU64::new(1)),
            prefetch: Arc::new(AtomicU16::new(0)),
            confirm: AtomicBool::new(false),
        })
    }

    async fn process_events(&self, timeout: Duration) -> Result<()> {
        if !timeout.is_zero() {
            tokio::time::sleep(timeout).await;
        }
        self.broker.liveness(&self.core)?;
        self.core.answer_heartbeat();
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        if self.core.expired(Instant::now()) {
            self.broker
                .close_connection(&self.core, "missed heartbeats from client, timeout");
        }
        self.core.state()
    }

    async fn close(&self) -> Result<()> {
        if self.core.state() == ConnectionState::Closed {
            return Ok(());
        }
        self.core.begin_close();
        self.broker.close_connection(&self.core, "closed by client");
        Ok(())
    }
}

/// A channel on an in-memory connection.
#[derive(Debug)]
pub struct MemoryChannel {
    broker: MemoryBroker,
    core: Arc<ConnectionCore>,
    id: u64,
    next_tag: Arc<AtomicU64>,
    prefetch: Arc<AtomicU16>,
    confirm: AtomicBool,
}

impl MemoryChannel {
    fn ready(&self) -> Result<()> {
        self.broker.liveness(&self.core)?;
        self.core.touch();
        Ok(())
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn basic_qos(&self, prefetch: u16) -> Result<()> {
        self.ready()?;
        self.prefetch.store(prefetch, Ordering::Release);
        Ok(())
    }

    async fn confirm_select(&self) -> Result<()> {
        self.ready()?;
        self.confirm.store(true, Ordering::Release);
        Ok(())
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        self.ready()?;
        let outbox = Arc::new(Mutex::new(VecDeque::new()));
        let changes = self.broker.subscribe();
        {
            let mut state = lock(&self.broker.state);
            if !state.queues.contains_key(queue) {
                return Err(BridgeError::Channel {
                    code: 404,
                    text: format!("NOT_FOUND - no queue '{queue}'"),
                });
            }
            state.consumers.push(ConsumerSlot {
                connection: self.core.id,
                channel: self.id,
                queue: queue.to_string(),
                next_tag: self.next_tag.clone(),
                prefetch: self.prefetch.clone(),
                outbox: outbox.clone(),
            });
            self.broker.dispatch(&mut state);
        }
        debug!(broker = %self.broker.name, queue, consumer_tag, "consumer registered");
        self.broker.bump();

        let cursor = ConsumerCursor {
            broker: self.broker.clone(),
            core: self.core.clone(),
            outbox,
            changes,
        };
        Ok(stream::unfold(cursor, |mut cursor| async move {
            let delivery = cursor.next_delivery().await?;
            Some((Ok::<_, BridgeError>(delivery), cursor))
        })
        .boxed())
    }

    async fn basic_publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        self.ready()?;
        let confirm = self.confirm.load(Ordering::Acquire);
        self.broker.publish(exchange, routing_key, body, confirm)
    }

    async fn basic_ack(&self, tag: DeliveryTag) -> Result<()> {
        self.ready()?;
        self.broker.settle(self.core.id, self.id, tag, Settle::Ack)
    }

    async fn basic_nack(&self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        self.ready()?;
        self.broker
            .settle(self.core.id, self.id, tag, Settle::Nack { requeue })
    }
}

/// Client end of one `basic_consume` registration.
struct ConsumerCursor {
    broker: MemoryBroker,
    core: Arc<ConnectionCore>,
    outbox: Arc<Mutex<VecDeque<Delivery>>>,
    changes: watch::Receiver<u64>,
}

impl ConsumerCursor {
    /// Waiting for a delivery keeps answering heartbeats, like a blocking
    /// consume loop does.
    async fn next_delivery(&mut self) -> Option<Delivery> {
        let keepalive = self
            .core
            .heartbeat
            .map(|heartbeat| heartbeat / 2)
            .unwrap_or(Duration::from_secs(3600));

        loop {
            self.changes.borrow_and_update();
            self.broker.liveness(&self.core).ok()?;

            if let Some(delivery) = lock(&self.outbox).pop_front() {
                return Some(delivery);
            }

            tokio::select! {
                changed = self.changes.changed() => changed.ok()?,
                _ = tokio::time::sleep(keepalive) => self.core.answer_heartbeat(),
            }
        }
    }
}
