//! The event bus.
//!
//! [`EventBus`] ties the pieces together: it publishes events through the
//! shared [`PersistentConnection`] under a retry policy, keeps the broker
//! bindings of the service queue in step with its [`SubscriptionRegistry`],
//! and owns the background consume loop that dispatches deliveries.

use std::sync::Arc;

use sporty_core::IntegrationEvent;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::backoff::{sleep_or_cancel, BackoffConfig};
use crate::broker::{Broker, ExchangeKind, QueueOptions};
use crate::codec::{self, CodecError, EncodedEvent};
use crate::config::EventBusConfig;
use crate::connection::{ConnectionError, PersistentConnection};
use crate::consumer::{ConsumerContext, ConsumerHandle};
use crate::handler::{DynamicIntegrationEventHandler, HandlerScope, IntegrationEventHandler};
use crate::registry::{RemoveOutcome, SubscriptionRegistry};
use crate::subscription::{HandlerKey, SubscriptionInfo, SubscriptionKind};
use crate::EXCHANGE_NAME;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    /// The event could not be serialized. Never retried.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Declaring, binding or unbinding the service queue failed.
    #[error("Failed to update broker topology for {event_name}: {source}")]
    Topology {
        event_name: String,
        source: ConnectionError,
    },

    #[error("Failed to publish {event_name} after {attempts} attempt(s): {source}")]
    PublishFailed {
        event_name: String,
        attempts: u32,
        source: ConnectionError,
    },

    #[error("Event bus is shut down")]
    ShutDown,
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Publishes integration events and dispatches the ones this service
/// subscribed to.
///
/// `EventBus` is `Send + Sync`; share it behind an `Arc` and publish from
/// any task.
pub struct EventBus {
    connection: Arc<PersistentConnection>,
    scope: Arc<dyn HandlerScope>,
    registry: Arc<RwLock<SubscriptionRegistry>>,
    queue_name: String,
    publish_policy: BackoffConfig,
    /// The consume loop. Held for the whole of every subscribe and
    /// unsubscribe, which serializes topology changes.
    consumer: Mutex<Option<ConsumerHandle>>,
    cancel: CancellationToken,
}

impl EventBus {
    /// Create a bus consuming from `queue_name`.
    ///
    /// `scope` resolves handler instances for every delivery;
    /// `publish_policy` bounds publish retries.
    pub fn new(
        connection: Arc<PersistentConnection>,
        scope: Arc<dyn HandlerScope>,
        queue_name: impl Into<String>,
        publish_policy: BackoffConfig,
    ) -> Self {
        Self {
            connection,
            scope,
            registry: Arc::new(RwLock::new(SubscriptionRegistry::new())),
            queue_name: queue_name.into(),
            publish_policy,
            consumer: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Create a bus with its own connection, configured from `config`.
    pub fn from_config(
        broker: Arc<dyn Broker>,
        scope: Arc<dyn HandlerScope>,
        config: &EventBusConfig,
    ) -> Self {
        let connection = Arc::new(PersistentConnection::new(
            broker,
            config.broker_options(),
            config.backoff(),
        ));
        Self::new(connection, scope, config.service_name.clone(), config.backoff())
    }

    /// The durable queue this bus consumes from.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn connection(&self) -> &Arc<PersistentConnection> {
        &self.connection
    }

    pub async fn has_subscriptions_for_event(&self, event_name: &str) -> bool {
        self.registry
            .read()
            .await
            .has_subscriptions_for_event(event_name)
    }

    /// Handlers currently registered for `event_name`.
    pub async fn handlers_for_event(&self, event_name: &str) -> Vec<SubscriptionInfo> {
        self.registry.read().await.get_handlers_for_event(event_name)
    }

    /// `true` while the consume loop is running.
    pub async fn is_consuming(&self) -> bool {
        self.consumer
            .lock()
            .await
            .as_ref()
            .is_some_and(ConsumerHandle::is_running)
    }

    // -- publish ----------------------------------------------------------

    /// Publish `event` to the exchange, routed by its event name.
    ///
    /// The event is serialized once, up front; a serialization failure is
    /// returned without any broker traffic. Transient broker failures are
    /// retried with exponential backoff; anything else fails at once.
    pub async fn publish<E: IntegrationEvent>(&self, event: &E) -> Result<(), EventBusError> {
        if self.cancel.is_cancelled() {
            return Err(EventBusError::ShutDown);
        }

        let encoded = codec::encode(event)?;
        let event_id = event.id();
        let event_name = encoded.routing_key;
        let max_attempts = self.publish_policy.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            tracing::trace!(%event_id, event_name, attempt, "Publishing event to event bus");

            let err = match self.try_publish(&encoded).await {
                Ok(()) => {
                    tracing::debug!(%event_id, event_name, attempt, "Published event");
                    return Ok(());
                }
                Err(e) => e,
            };

            if !err.is_transient() || attempt >= max_attempts {
                tracing::error!(
                    %event_id,
                    event_name,
                    attempts = attempt,
                    error = %err,
                    "Could not publish event",
                );
                return Err(EventBusError::PublishFailed {
                    event_name: event_name.to_string(),
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = self.publish_policy.delay_before_retry(attempt);
            tracing::warn!(
                %event_id,
                event_name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Could not publish event {event_id} after {:.1}s",
                delay.as_secs_f64(),
            );
            if !sleep_or_cancel(delay, &self.cancel).await {
                return Err(EventBusError::ShutDown);
            }
        }
    }

    /// One publish attempt on a fresh session.
    async fn try_publish(&self, encoded: &EncodedEvent) -> Result<(), ConnectionError> {
        self.connection.connect_once().await?;

        let session = self.connection.open_session().await?;
        session
            .exchange_declare(EXCHANGE_NAME, ExchangeKind::Direct)
            .await?;
        session
            .basic_publish(
                EXCHANGE_NAME,
                encoded.routing_key,
                encoded.properties.clone(),
                encoded.body.clone(),
            )
            .await?;
        Ok(())
    }

    // -- subscriptions ----------------------------------------------------

    /// Subscribe handler `H` to typed events `E`.
    pub async fn subscribe<E, H>(&self) -> Result<(), EventBusError>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        self.add_subscription(E::event_name(), SubscriptionInfo::typed::<E, H>())
            .await
    }

    /// Subscribe handler `H` to `event_name`, receiving raw JSON.
    pub async fn subscribe_dynamic<H>(&self, event_name: &str) -> Result<(), EventBusError>
    where
        H: DynamicIntegrationEventHandler,
    {
        self.add_subscription(event_name, SubscriptionInfo::dynamic::<H>(event_name))
            .await
    }

    pub async fn unsubscribe<E, H>(&self) -> Result<(), EventBusError>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        self.remove_subscription(E::event_name(), SubscriptionKind::Typed, HandlerKey::of::<H>())
            .await
    }

    pub async fn unsubscribe_dynamic<H>(&self, event_name: &str) -> Result<(), EventBusError>
    where
        H: DynamicIntegrationEventHandler,
    {
        self.remove_subscription(event_name, SubscriptionKind::Dynamic, HandlerKey::of::<H>())
            .await
    }

    async fn add_subscription(
        &self,
        event_name: &str,
        info: SubscriptionInfo,
    ) -> Result<(), EventBusError> {
        let mut consumer = self.consumer.lock().await;
        if self.cancel.is_cancelled() {
            return Err(EventBusError::ShutDown);
        }

        let handler = info.handler();
        if !self.has_subscriptions_for_event(event_name).await {
            self.bind(event_name)
                .await
                .map_err(|source| EventBusError::Topology {
                    event_name: event_name.to_string(),
                    source,
                })?;
        }

        if self.registry.write().await.add_subscription(event_name, info) {
            tracing::info!(event_name, %handler, "Subscribing to event {event_name} with {handler}");
        } else {
            tracing::debug!(event_name, %handler, "Handler already subscribed");
        }

        if !consumer.as_ref().is_some_and(ConsumerHandle::is_running) {
            *consumer = Some(ConsumerHandle::spawn(
                self.consumer_context(),
                self.cancel.child_token(),
            ));
        }
        Ok(())
    }

    async fn remove_subscription(
        &self,
        event_name: &str,
        kind: SubscriptionKind,
        handler: HandlerKey,
    ) -> Result<(), EventBusError> {
        let mut consumer = self.consumer.lock().await;

        let (outcome, registry_empty) = {
            let mut registry = self.registry.write().await;
            let outcome = registry.remove_subscription(event_name, kind, &handler);
            (outcome, registry.is_empty())
        };

        let unbound = match outcome {
            RemoveOutcome::NotFound => {
                tracing::debug!(event_name, %handler, "No such subscription");
                return Ok(());
            }
            RemoveOutcome::Removed => {
                tracing::info!(event_name, %handler, "Unsubscribed from event {event_name}");
                Ok(())
            }
            RemoveOutcome::EventRemoved => {
                tracing::info!(event_name, %handler, "Last handler removed, unbinding {event_name}");
                self.unbind(event_name).await
            }
        };

        if registry_empty {
            if let Some(handle) = consumer.take() {
                handle.stop().await;
            }
        }

        unbound.map_err(|source| EventBusError::Topology {
            event_name: event_name.to_string(),
            source,
        })
    }

    /// Declare the exchange and service queue, then bind `event_name`.
    async fn bind(&self, event_name: &str) -> Result<(), ConnectionError> {
        if !self.connection.is_connected().await {
            self.connection.try_connect().await;
        }

        let session = self.connection.open_session().await?;
        session
            .exchange_declare(EXCHANGE_NAME, ExchangeKind::Direct)
            .await?;
        session
            .queue_declare(&self.queue_name, QueueOptions::durable())
            .await?;
        session
            .queue_bind(&self.queue_name, EXCHANGE_NAME, event_name)
            .await?;
        Ok(())
    }

    async fn unbind(&self, event_name: &str) -> Result<(), ConnectionError> {
        if !self.connection.is_connected().await {
            self.connection.try_connect().await;
        }

        let session = self.connection.open_session().await?;
        session
            .queue_unbind(&self.queue_name, EXCHANGE_NAME, event_name)
            .await?;
        Ok(())
    }

    fn consumer_context(&self) -> ConsumerContext {
        ConsumerContext {
            connection: Arc::clone(&self.connection),
            registry: Arc::clone(&self.registry),
            scope: Arc::clone(&self.scope),
            queue_name: self.queue_name.clone(),
            backoff: self.publish_policy.clone(),
        }
    }

    // -- lifecycle --------------------------------------------------------

    /// Stop consuming, drop every subscription and close the connection.
    ///
    /// A handler that is running when this is called gets a few seconds to
    /// finish and have its message acknowledged. Later calls to `publish` and `subscribe`
    /// return [`EventBusError::ShutDown`].
    pub async fn shutdown(&self) {
        let mut consumer = self.consumer.lock().await;
        self.cancel.cancel();

        if let Some(handle) = consumer.take() {
            handle.shutdown().await;
        }
        self.registry.write().await.clear();
        self.connection.close().await;

        tracing::info!(queue = %self.queue_name, "Event bus shut down");
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use sporty_core::events::UserCreatedEvent;
    use uuid::Uuid;

    use super::*;
    use crate::broker::memory::InMemoryBroker;
    use crate::broker::{BrokerError, BrokerOptions, DeliveryMode};
    use crate::handler::HandlerContainer;

    struct NoopHandler;

    #[async_trait]
    impl IntegrationEventHandler<UserCreatedEvent> for NoopHandler {
        async fn handle(&self, _event: UserCreatedEvent) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn fast_policy(retry_count: u32) -> BackoffConfig {
        BackoffConfig {
            retry_count,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            multiplier: 2.0,
        }
    }

    fn bus_on(broker: &InMemoryBroker, retry_count: u32) -> EventBus {
        let connection = Arc::new(PersistentConnection::new(
            Arc::new(broker.clone()),
            BrokerOptions {
                host: "localhost".into(),
                ..Default::default()
            },
            fast_policy(retry_count),
        ));
        let mut container = HandlerContainer::new();
        container.register(|| NoopHandler);
        EventBus::new(connection, Arc::new(container), "groups", fast_policy(retry_count))
    }

    #[tokio::test]
    async fn publish_declares_direct_exchange_and_sends_persistent_message() {
        let broker = InMemoryBroker::new();
        let bus = bus_on(&broker, 0);
        let event = UserCreatedEvent::new(Uuid::new_v4(), "Ann", "Lee");

        bus.publish(&event).await.expect("publish should succeed");

        assert_eq!(broker.exchange_kind(EXCHANGE_NAME), Some(ExchangeKind::Direct));
        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].routing_key, "UserCreatedEvent");
        assert_eq!(published[0].properties.delivery_mode, DeliveryMode::Persistent);
        assert_eq!(broker.open_channel_count(), 0, "publish session should be closed");
    }

    #[tokio::test]
    async fn subscribe_declares_durable_queue_and_binds_event_name() {
        let broker = InMemoryBroker::new();
        let bus = bus_on(&broker, 0);

        bus.subscribe::<UserCreatedEvent, NoopHandler>()
            .await
            .expect("subscribe should succeed");

        assert_eq!(broker.queue_options("groups"), Some(QueueOptions::durable()));
        assert_eq!(broker.bindings("groups"), vec!["UserCreatedEvent".to_string()]);
        assert!(bus.is_consuming().await);

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn refused_credentials_fail_publish_without_retry() {
        let broker = InMemoryBroker::with_credentials("guest", "guest");
        let bus = bus_on(&broker, 5);
        let event = UserCreatedEvent::new(Uuid::new_v4(), "Ann", "Lee");

        let err = bus.publish(&event).await.unwrap_err();
        assert_matches!(
            err,
            EventBusError::PublishFailed {
                attempts: 1,
                source: ConnectionError::Broker(BrokerError::AccessRefused(_)),
                ..
            }
        );
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn operations_after_shutdown_are_rejected() {
        let broker = InMemoryBroker::new();
        let bus = bus_on(&broker, 0);
        bus.shutdown().await;

        let event = UserCreatedEvent::new(Uuid::new_v4(), "Ann", "Lee");
        assert_matches!(bus.publish(&event).await, Err(EventBusError::ShutDown));
        assert_matches!(
            bus.subscribe::<UserCreatedEvent, NoopHandler>().await,
            Err(EventBusError::ShutDown)
        );
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn unsubscribing_unknown_handler_is_a_no_op() {
        let broker = InMemoryBroker::new();
        let bus = bus_on(&broker, 0);

        bus.unsubscribe::<UserCreatedEvent, NoopHandler>()
            .await
            .expect("unsubscribe should succeed");
        assert!(!bus.is_consuming().await);
        assert_eq!(broker.connect_attempts(), 0);
    }
}
