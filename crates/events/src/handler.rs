//! Handler contracts and handler resolution.
//!
//! Services implement [`IntegrationEventHandler`] for typed events or
//! [`DynamicIntegrationEventHandler`] for raw JSON documents. The bus
//! never owns handler instances: it asks a [`HandlerScope`] for one each
//! time a message arrives, so handlers can be built fresh per message
//! with whatever collaborators the service wires in.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sporty_core::IntegrationEvent;

use crate::subscription::HandlerKey;

/// Handles one concrete integration event type.
#[async_trait]
pub trait IntegrationEventHandler<E: IntegrationEvent>: Send + Sync + 'static {
    async fn handle(&self, event: E) -> anyhow::Result<()>;
}

/// Handles events as untyped JSON documents.
#[async_trait]
pub trait DynamicIntegrationEventHandler: Send + Sync + 'static {
    async fn handle(&self, event_data: serde_json::Value) -> anyhow::Result<()>;
}

/// External dependency-resolution boundary.
///
/// Returns `None` when the scope cannot build the requested handler; the
/// bus then skips that handler for the current message.
pub trait HandlerScope: Send + Sync {
    fn resolve(&self, handler: &HandlerKey) -> Option<Arc<dyn Any + Send + Sync>>;
}

/// Resolve `H` from `scope` and downcast it to its concrete type.
pub fn resolve_handler<H: Send + Sync + 'static>(scope: &dyn HandlerScope) -> Option<Arc<H>> {
    scope
        .resolve(&HandlerKey::of::<H>())?
        .downcast::<H>()
        .ok()
}

type Factory = Arc<dyn Fn() -> Arc<dyn Any + Send + Sync> + Send + Sync>;

/// A simple [`HandlerScope`]: one factory per handler type.
///
/// Factories registered with [`register`](Self::register) build a new
/// handler on every resolution; [`register_instance`](Self::register_instance)
/// shares one instance.
#[derive(Default, Clone)]
pub struct HandlerContainer {
    factories: HashMap<TypeId, Factory>,
}

impl HandlerContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a fresh `H` from `factory` each time it is resolved.
    pub fn register<H, F>(&mut self, factory: F) -> &mut Self
    where
        H: Send + Sync + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.factories.insert(
            TypeId::of::<H>(),
            Arc::new(move || Arc::new(factory()) as Arc<dyn Any + Send + Sync>),
        );
        self
    }

    /// Resolve `H` to the same shared instance every time.
    pub fn register_instance<H>(&mut self, instance: Arc<H>) -> &mut Self
    where
        H: Send + Sync + 'static,
    {
        self.factories.insert(
            TypeId::of::<H>(),
            Arc::new(move || Arc::clone(&instance) as Arc<dyn Any + Send + Sync>),
        );
        self
    }

    pub fn contains<H: 'static>(&self) -> bool {
        self.factories.contains_key(&TypeId::of::<H>())
    }
}

impl HandlerScope for HandlerContainer {
    fn resolve(&self, handler: &HandlerKey) -> Option<Arc<dyn Any + Send + Sync>> {
        self.factories.get(&handler.type_id()).map(|factory| factory())
    }
}
