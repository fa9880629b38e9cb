//! Broker transport seam.
//!
//! Models an AMQP-style broker: named exchanges route published messages
//! to queues whose bindings match the routing key; consumers receive
//! [`Delivery`]s and must acknowledge each one by delivery tag. Channels
//! are cheap and short-lived, connections are long-lived.
//!
//! [`amqp::AmqpBroker`] talks to a RabbitMQ-compatible server;
//! [`memory::InMemoryBroker`] implements the whole contract in-process.

pub mod amqp;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Stream of deliveries for one consumer. Ends when the channel closes.
pub type DeliveryStream = mpsc::UnboundedReceiver<Delivery>;

/// Connection parameters for a broker.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct BrokerOptions {
    pub host: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl std::fmt::Debug for BrokerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerOptions")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Exchange routing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Routes to queues bound with exactly the message's routing key.
    Direct,
}

/// Queue declaration flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survives a broker restart.
    pub durable: bool,
    /// Private to the declaring connection.
    pub exclusive: bool,
    /// Deleted when the last consumer goes away.
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Durable, shared, long-lived: one per consuming service.
    pub const fn durable() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

/// Whether the broker should write a message to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    #[default]
    Transient,
    Persistent,
}

/// Per-message publish properties.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PublishProperties {
    pub delivery_mode: DeliveryMode,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    /// Ask the broker to report unroutable messages instead of dropping.
    pub mandatory: bool,
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel-scoped tag used to acknowledge this delivery.
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub properties: PublishProperties,
    pub body: Vec<u8>,
    /// Set when the message was delivered before but never acknowledged.
    pub redelivered: bool,
}

/// Factory for broker connections.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a new connection.
    async fn connect(&self, options: &BrokerOptions) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// A long-lived connection to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a new channel on this connection.
    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError>;

    /// `false` once the connection was closed by either side.
    fn is_open(&self) -> bool;

    fn close(&self);
}

/// A short-lived session on a connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare an exchange. Idempotent for matching declarations.
    async fn exchange_declare(&self, exchange: &str, kind: ExchangeKind) -> Result<(), BrokerError>;

    /// Declare a queue. Idempotent for matching declarations.
    async fn queue_declare(&self, queue: &str, options: QueueOptions) -> Result<(), BrokerError>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError>;

    async fn queue_unbind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: PublishProperties,
        body: Vec<u8>,
    ) -> Result<(), BrokerError>;

    /// Start consuming a queue with manual acknowledgement.
    async fn basic_consume(&self, queue: &str) -> Result<DeliveryStream, BrokerError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// `false` once the channel or its connection was closed.
    fn is_open(&self) -> bool;

    /// Close the channel. Unacknowledged deliveries are requeued.
    fn close(&self);
}

/// Errors reported by a broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The broker could not be reached at all.
    #[error("Broker unreachable at {host}: {reason}")]
    Unreachable { host: String, reason: String },

    /// A socket-level failure on an established connection.
    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Channel closed")]
    ChannelClosed,

    /// The broker rejected the supplied credentials.
    #[error("Access refused for user {0:?}")]
    AccessRefused(Option<String>),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// A redeclaration conflicted with the existing entity.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),
}

impl BrokerError {
    /// Whether retrying the operation on a fresh connection may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unreachable { .. } | Self::Io(_) | Self::ConnectionClosed | Self::ChannelClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_failures_are_transient() {
        let unreachable = BrokerError::Unreachable {
            host: "localhost".into(),
            reason: "refused".into(),
        };
        assert!(unreachable.is_transient());
        assert!(BrokerError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset)).is_transient());
        assert!(BrokerError::ChannelClosed.is_transient());
    }

    #[test]
    fn protocol_failures_are_not_transient() {
        assert!(!BrokerError::AccessRefused(Some("guest".into())).is_transient());
        assert!(!BrokerError::PreconditionFailed("durable mismatch".into()).is_transient());
        assert!(!BrokerError::NotFound {
            kind: "exchange",
            name: "missing".into()
        }
        .is_transient());
    }

    #[test]
    fn options_debug_redacts_password() {
        let options = BrokerOptions {
            host: "rabbitmq".into(),
            username: Some("guest".into()),
            password: Some("secret".into()),
        };
        let rendered = format!("{options:?}");
        assert!(rendered.contains("rabbitmq"));
        assert!(!rendered.contains("secret"));
    }
}
