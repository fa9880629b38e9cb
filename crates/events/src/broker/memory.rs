//! In-process broker.
//!
//! [`InMemoryBroker`] implements the [`Broker`] contract without a
//! network: direct exchanges, durable queues, bindings, persistent publish and
//! manual-ack consumption all live in one shared state behind a mutex.
//! Deliveries that were never acknowledged go back to the head of their
//! queue when the consuming channel closes, so consumers see
//! at-least-once delivery exactly as they would against a real broker.
//!
//! The broker can also simulate failures: refusing connections,
//! socket errors on publish, and broker-initiated closure of channels
//! or connections.
//!
//! ```
//! use sporty_events::broker::memory::InMemoryBroker;
//!
//! let broker = InMemoryBroker::new();
//! broker.set_reachable(false);
//! assert_eq!(broker.connect_attempts(), 0);
//! ```

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, BrokerOptions, Delivery, DeliveryStream,
    ExchangeKind, PublishProperties, QueueOptions,
};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// How many accepted messages [`InMemoryBroker::published`] remembers.
pub const PUBLISHED_HISTORY: usize = 1_024;

/// A message as accepted by an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub properties: PublishProperties,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    message: PublishedMessage,
    redelivered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

struct Consumer {
    channel_id: u64,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct QueueState {
    options: QueueOptions,
    ready: VecDeque<QueuedMessage>,
    consumer: Option<Consumer>,
    /// In-flight deliveries by tag, with the channel that owns them.
    unacked: BTreeMap<u64, (u64, QueuedMessage)>,
}

impl QueueState {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            ready: VecDeque::new(),
            consumer: None,
            unacked: BTreeMap::new(),
        }
    }

    /// Hand ready messages to the consumer until one of them runs out.
    fn pump(&mut self, next_tag: &mut u64) {
        while let Some(consumer) = &self.consumer {
            let Some(queued) = self.ready.pop_front() else {
                return;
            };

            *next_tag += 1;
            let tag = *next_tag;
            let delivery = Delivery {
                delivery_tag: tag,
                exchange: queued.message.exchange.clone(),
                routing_key: queued.message.routing_key.clone(),
                properties: queued.message.properties.clone(),
                body: queued.message.body.clone(),
                redelivered: queued.redelivered,
            };

            if consumer.tx.send(delivery).is_ok() {
                self.unacked.insert(tag, (consumer.channel_id, queued));
            } else {
                // Receiver dropped without closing the channel.
                self.ready.push_front(queued);
                self.consumer = None;
            }
        }
    }

    /// Put a channel's in-flight deliveries back at the head, in order.
    fn requeue_from(&mut self, channel_id: u64) {
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, (owner, _))| *owner == channel_id)
            .map(|(tag, _)| *tag)
            .collect();

        for tag in tags.into_iter().rev() {
            if let Some((_, mut queued)) = self.unacked.remove(&tag) {
                queued.redelivered = true;
                self.ready.push_front(queued);
            }
        }
    }
}

#[derive(Default)]
struct BrokerState {
    reachable_override: Option<bool>,
    credentials: Option<(String, String)>,
    failing_publishes: usize,
    connect_attempts: usize,
    publish_attempts: usize,
    next_id: u64,
    next_delivery_tag: u64,
    open_connections: HashSet<u64>,
    /// Open channel id -> owning connection id.
    open_channels: HashMap<u64, u64>,
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    /// The most recent accepted messages, oldest first.
    published: VecDeque<PublishedMessage>,
}

impl BrokerState {
    fn reachable(&self) -> bool {
        self.reachable_override.unwrap_or(true)
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_channel(&self, channel_id: u64) -> Result<(), BrokerError> {
        match self.open_channels.get(&channel_id) {
            None => Err(BrokerError::ChannelClosed),
            Some(connection_id) if !self.open_connections.contains(connection_id) => {
                Err(BrokerError::ConnectionClosed)
            }
            Some(_) => Ok(()),
        }
    }

    fn close_channel(&mut self, channel_id: u64) {
        if self.open_channels.remove(&channel_id).is_none() {
            return;
        }

        let next_tag = &mut self.next_delivery_tag;
        for queue in self.queues.values_mut() {
            if queue
                .consumer
                .as_ref()
                .is_some_and(|c| c.channel_id == channel_id)
            {
                queue.consumer = None;
            }
            queue.requeue_from(channel_id);
            queue.pump(next_tag);
        }
    }

    fn close_connection(&mut self, connection_id: u64) {
        self.open_connections.remove(&connection_id);
        let channels: Vec<u64> = self
            .open_channels
            .iter()
            .filter(|(_, owner)| **owner == connection_id)
            .map(|(id, _)| *id)
            .collect();
        for channel_id in channels {
            self.close_channel(channel_id);
        }
    }

    fn route(&mut self, message: PublishedMessage) {
        if !self.exchanges.contains_key(&message.exchange) {
            return;
        }

        let mut targets: Vec<String> = Vec::new();
        for binding in &self.bindings {
            let matches = binding.exchange == message.exchange
                && binding.routing_key == message.routing_key;
            if matches && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }

        let next_tag = &mut self.next_delivery_tag;
        for name in targets {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.ready.push_back(QueuedMessage {
                    message: message.clone(),
                    redelivered: false,
                });
                queue.pump(next_tag);
            }
        }

        if self.published.len() == PUBLISHED_HISTORY {
            self.published.pop_front();
        }
        self.published.push_back(message);
    }
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// InMemoryBroker
// ---------------------------------------------------------------------------

/// A complete broker living in process memory.
///
/// Cheap to clone; clones share the same exchanges, queues and
/// connections, so a publisher and a consumer built from two clones
/// talk to each other.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker that only accepts the given credentials.
    pub fn with_credentials(username: impl Into<String>, password: impl Into<String>) -> Self {
        let broker = Self::new();
        lock(&broker.state).credentials = Some((username.into(), password.into()));
        broker
    }

    /// When `false`, every connection attempt fails as unreachable.
    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.state).reachable_override = Some(reachable);
    }

    /// Make the next `count` publishes fail with a socket error.
    pub fn fail_next_publishes(&self, count: usize) {
        lock(&self.state).failing_publishes = count;
    }

    /// Close every open connection from the broker side.
    pub fn disconnect_all(&self) {
        let mut state = lock(&self.state);
        let connections: Vec<u64> = state.open_connections.iter().copied().collect();
        for connection_id in connections {
            state.close_connection(connection_id);
        }
    }

    /// Close, from the broker side, every channel that has a consumer.
    pub fn close_consumer_channels(&self) {
        let mut state = lock(&self.state);
        let channels: Vec<u64> = state
            .queues
            .values()
            .filter_map(|q| q.consumer.as_ref().map(|c| c.channel_id))
            .collect();
        for channel_id in channels {
            state.close_channel(channel_id);
        }
    }

    pub fn connect_attempts(&self) -> usize {
        lock(&self.state).connect_attempts
    }

    pub fn publish_attempts(&self) -> usize {
        lock(&self.state).publish_attempts
    }

    /// The last [`PUBLISHED_HISTORY`] messages an exchange accepted,
    /// routed or not, oldest first.
    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.state).published.iter().cloned().collect()
    }

    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        lock(&self.state).exchanges.get(exchange).copied()
    }

    pub fn queue_options(&self, queue: &str) -> Option<QueueOptions> {
        lock(&self.state).queues.get(queue).map(|q| q.options)
    }

    /// Routing keys bound to `queue`, in binding order.
    pub fn bindings(&self, queue: &str) -> Vec<String> {
        lock(&self.state)
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .map(|b| b.routing_key.clone())
            .collect()
    }

    /// Messages waiting in `queue` for a consumer.
    pub fn queue_depth(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Messages delivered from `queue` but not yet acknowledged.
    pub fn unacked_count(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    pub fn has_consumer(&self, queue: &str) -> bool {
        lock(&self.state)
            .queues
            .get(queue)
            .is_some_and(|q| q.consumer.is_some())
    }

    pub fn open_connection_count(&self) -> usize {
        lock(&self.state).open_connections.len()
    }

    pub fn open_channel_count(&self) -> usize {
        lock(&self.state).open_channels.len()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self, options: &BrokerOptions) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let mut state = lock(&self.state);
        state.connect_attempts += 1;

        if !state.reachable() {
            return Err(BrokerError::Unreachable {
                host: options.host.clone(),
                reason: "connection refused".into(),
            });
        }

        if let Some((username, password)) = &state.credentials {
            let accepted = options.username.as_deref() == Some(username.as_str())
                && options.password.as_deref() == Some(password.as_str());
            if !accepted {
                return Err(BrokerError::AccessRefused(options.username.clone()));
            }
        }

        let id = state.next_id();
        state.open_connections.insert(id);

        Ok(Arc::new(MemoryConnection {
            id,
            state: Arc::clone(&self.state),
        }))
    }
}

// ---------------------------------------------------------------------------
// Connection and channel
// ---------------------------------------------------------------------------

struct MemoryConnection {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        let mut state = lock(&self.state);
        if !state.open_connections.contains(&self.id) {
            return Err(BrokerError::ConnectionClosed);
        }

        let id = state.next_id();
        state.open_channels.insert(id, self.id);

        Ok(Box::new(MemoryChannel {
            id,
            state: Arc::clone(&self.state),
        }))
    }

    fn is_open(&self) -> bool {
        lock(&self.state).open_connections.contains(&self.id)
    }

    fn close(&self) {
        lock(&self.state).close_connection(self.id);
    }
}

struct MemoryChannel {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn exchange_declare(&self, exchange: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        state.check_channel(self.id)?;

        match state.exchanges.get(exchange) {
            Some(existing) if *existing != kind => Err(BrokerError::PreconditionFailed(format!(
                "exchange {exchange} already declared as {existing:?}"
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(exchange.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn queue_declare(&self, queue: &str, options: QueueOptions) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        state.check_channel(self.id)?;

        match state.queues.get(queue) {
            Some(existing) if existing.options != options => {
                Err(BrokerError::PreconditionFailed(format!(
                    "queue {queue} already declared with {:?}",
                    existing.options
                )))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(queue.to_string(), QueueState::new(options));
                Ok(())
            }
        }
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        state.check_channel(self.id)?;

        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::NotFound {
                kind: "exchange",
                name: exchange.to_string(),
            });
        }
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::NotFound {
                kind: "queue",
                name: queue.to_string(),
            });
        }

        let binding = Binding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn queue_unbind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        state.check_channel(self.id)?;

        if !state.queues.contains_key(queue) {
            return Err(BrokerError::NotFound {
                kind: "queue",
                name: queue.to_string(),
            });
        }

        state
            .bindings
            .retain(|b| !(b.queue == queue && b.exchange == exchange && b.routing_key == routing_key));
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: PublishProperties,
        body: Vec<u8>,
    ) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        state.publish_attempts += 1;
        state.check_channel(self.id)?;

        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(BrokerError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "simulated socket failure",
            )));
        }

        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::NotFound {
                kind: "exchange",
                name: exchange.to_string(),
            });
        }

        state.route(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties,
            body,
        });
        Ok(())
    }

    async fn basic_consume(&self, queue: &str) -> Result<DeliveryStream, BrokerError> {
        let mut guard = lock(&self.state);
        guard.check_channel(self.id)?;

        let state = &mut *guard;
        let Some(queue_state) = state.queues.get_mut(queue) else {
            return Err(BrokerError::NotFound {
                kind: "queue",
                name: queue.to_string(),
            });
        };

        let (tx, rx) = mpsc::unbounded_channel();
        queue_state.consumer = Some(Consumer {
            channel_id: self.id,
            tx,
        });
        queue_state.pump(&mut state.next_delivery_tag);

        Ok(rx)
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        state.check_channel(self.id)?;

        for queue in state.queues.values_mut() {
            if queue
                .unacked
                .get(&delivery_tag)
                .is_some_and(|(owner, _)| *owner == self.id)
            {
                queue.unacked.remove(&delivery_tag);
                return Ok(());
            }
        }

        Err(BrokerError::PreconditionFailed(format!(
            "unknown delivery tag {delivery_tag}"
        )))
    }

    fn is_open(&self) -> bool {
        lock(&self.state).check_channel(self.id).is_ok()
    }

    fn close(&self) {
        lock(&self.state).close_channel(self.id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
