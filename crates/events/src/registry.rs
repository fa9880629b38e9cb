//! In-memory subscription registry.
//!
//! Maps each event name to the handlers subscribed to it, in registration
//! order, and remembers the concrete event type for typed subscriptions.
//! The registry knows nothing about the broker: callers use the returned
//! [`RemoveOutcome`] to decide when a routing key should be unbound.

use std::collections::HashMap;

use sporty_core::IntegrationEvent;

use crate::handler::{DynamicIntegrationEventHandler, IntegrationEventHandler};
use crate::subscription::{EventTypeInfo, HandlerKey, SubscriptionInfo, SubscriptionKind};

/// Result of removing a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// No matching subscription existed.
    NotFound,
    /// Removed; other handlers remain for the event.
    Removed,
    /// Removed the last handler, so the event itself left the registry.
    EventRemoved,
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    handlers: HashMap<String, Vec<SubscriptionInfo>>,
    event_types: HashMap<String, EventTypeInfo>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logical name used as routing key for `E`.
    pub fn event_key<E: IntegrationEvent>() -> &'static str {
        E::event_name()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Register `H` for typed events `E`. Returns `false` if already present.
    pub fn add_typed_subscription<E, H>(&mut self) -> bool
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        self.add_subscription(E::event_name(), SubscriptionInfo::typed::<E, H>())
    }

    /// Register `H` for raw JSON documents under `event_name`.
    pub fn add_dynamic_subscription<H>(&mut self, event_name: &str) -> bool
    where
        H: DynamicIntegrationEventHandler,
    {
        self.add_subscription(event_name, SubscriptionInfo::dynamic::<H>(event_name))
    }

    /// Append `info` under `event_name` unless an equal descriptor exists.
    pub fn add_subscription(&mut self, event_name: &str, info: SubscriptionInfo) -> bool {
        let entries = self.handlers.entry(event_name.to_string()).or_default();
        if entries.contains(&info) {
            return false;
        }

        if let Some(event_type) = info.event_type() {
            self.event_types
                .entry(event_name.to_string())
                .or_insert(event_type);
        }
        entries.push(info);
        true
    }

    pub fn remove_typed_subscription<E, H>(&mut self) -> RemoveOutcome
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        self.remove_subscription(E::event_name(), SubscriptionKind::Typed, &HandlerKey::of::<H>())
    }

    pub fn remove_dynamic_subscription<H>(&mut self, event_name: &str) -> RemoveOutcome
    where
        H: DynamicIntegrationEventHandler,
    {
        self.remove_subscription(event_name, SubscriptionKind::Dynamic, &HandlerKey::of::<H>())
    }

    /// Remove the `(kind, handler)` subscription for `event_name`.
    pub fn remove_subscription(
        &mut self,
        event_name: &str,
        kind: SubscriptionKind,
        handler: &HandlerKey,
    ) -> RemoveOutcome {
        let Some(entries) = self.handlers.get_mut(event_name) else {
            return RemoveOutcome::NotFound;
        };
        let Some(position) = entries
            .iter()
            .position(|s| s.kind() == kind && s.handler() == *handler)
        else {
            return RemoveOutcome::NotFound;
        };

        entries.remove(position);
        if !entries.is_empty() {
            return RemoveOutcome::Removed;
        }

        self.handlers.remove(event_name);
        self.event_types.remove(event_name);
        RemoveOutcome::EventRemoved
    }

    pub fn has_subscriptions_for_event(&self, event_name: &str) -> bool {
        self.handlers
            .get(event_name)
            .is_some_and(|entries| !entries.is_empty())
    }

    /// Handlers for `event_name` in registration order.
    pub fn get_handlers_for_event(&self, event_name: &str) -> Vec<SubscriptionInfo> {
        self.handlers.get(event_name).cloned().unwrap_or_default()
    }

    pub fn get_event_type_by_name(&self, event_name: &str) -> Option<EventTypeInfo> {
        self.event_types.get(event_name).copied()
    }

    /// Every event name with at least one handler.
    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn clear(&mut self) {
        self.handlers.clear();
        self.event_types.clear();
    }
}
