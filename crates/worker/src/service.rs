//! Groups service bootstrap.

use std::sync::Arc;

use sporty_core::events::UserCreatedEvent;
use sporty_core::IntegrationEvent;
use sporty_events::{Broker, EventBus, EventBusConfig, EventBusError, HandlerContainer};

use crate::handlers::{AuditLogHandler, UserCreatedEventHandler};
use crate::members::MemberStore;

/// Handler scope for the Groups service.
///
/// `UserCreatedEventHandler` is built fresh for each message around the
/// shared member store.
pub fn handler_container(members: Arc<MemberStore>) -> HandlerContainer {
    let mut container = HandlerContainer::new();
    container
        .register(move || UserCreatedEventHandler::new(Arc::clone(&members)))
        .register(|| AuditLogHandler);
    container
}

/// Build the Groups event bus and subscribe its handlers.
///
/// The bus consumes from the queue named by `config.service_name`.
pub async fn start_groups_service(
    broker: Arc<dyn Broker>,
    config: &EventBusConfig,
    members: Arc<MemberStore>,
) -> Result<EventBus, EventBusError> {
    let bus = EventBus::from_config(broker, Arc::new(handler_container(members)), config);

    bus.subscribe::<UserCreatedEvent, UserCreatedEventHandler>()
        .await?;
    bus.subscribe_dynamic::<AuditLogHandler>(UserCreatedEvent::event_name())
        .await?;

    tracing::info!(queue = bus.queue_name(), "Groups service subscribed to user events");
    Ok(bus)
}
