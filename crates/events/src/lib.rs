//! Sporty integration-event bus.
//!
//! Lets services publish [`IntegrationEvent`]s to a message broker and
//! have other services consume and dispatch them to handlers:
//!
//! - [`broker`]: the transport seam ([`Broker`], [`BrokerConnection`],
//!   [`BrokerChannel`]), [`AmqpBroker`] for RabbitMQ, and
//!   [`InMemoryBroker`], an in-process broker with direct-exchange routing
//!   and manual acknowledgement.
//! - [`PersistentConnection`]: owns the single broker connection,
//!   reconnects with exponential backoff and hands out short-lived
//!   [`Session`]s.
//! - [`SubscriptionRegistry`]: which handlers care about which event name.
//! - [`EventBus`]: declares topology, publishes with retry, and runs the
//!   consume-and-dispatch loop.
//! - [`codec`]: the JSON wire boundary.
//!
//! [`IntegrationEvent`]: sporty_core::IntegrationEvent

pub mod backoff;
pub mod broker;
pub mod bus;
pub mod codec;
pub mod config;
pub mod connection;
pub mod handler;
pub mod registry;
pub mod subscription;

mod consumer;

pub use backoff::BackoffConfig;
pub use broker::amqp::AmqpBroker;
pub use broker::memory::InMemoryBroker;
pub use broker::{Broker, BrokerChannel, BrokerConnection, BrokerError, BrokerOptions};
pub use bus::{EventBus, EventBusError};
pub use config::{ConfigError, EventBusConfig};
pub use connection::{ConnectionError, PersistentConnection, Session};
pub use handler::{
    DynamicIntegrationEventHandler, HandlerContainer, HandlerScope, IntegrationEventHandler,
};
pub use registry::{RemoveOutcome, SubscriptionRegistry};
pub use subscription::{EventTypeInfo, HandlerKey, SubscriptionInfo, SubscriptionKind};

/// Name of the direct exchange every service publishes to.
pub const EXCHANGE_NAME: &str = "sporty_event_bus";
