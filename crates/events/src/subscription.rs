//! Subscription descriptors.
//!
//! A [`SubscriptionInfo`] records that some handler type wants messages
//! for an event name. It does not hold a handler instance; instead it
//! carries a dispatch closure, built at subscription time with the
//! concrete event and handler types, that resolves the handler from a
//! [`HandlerScope`], decodes the body and invokes it.

use std::any::TypeId;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use sporty_core::{simple_type_name, IntegrationEvent};

use crate::codec::{self, CodecError};
use crate::handler::{
    resolve_handler, DynamicIntegrationEventHandler, HandlerScope, IntegrationEventHandler,
};

// ---------------------------------------------------------------------------
// HandlerKey / EventTypeInfo
// ---------------------------------------------------------------------------

/// Opaque reference to a handler implementation type.
#[derive(Clone, Copy)]
pub struct HandlerKey {
    type_id: TypeId,
    type_name: &'static str,
}

impl HandlerKey {
    pub fn of<H: ?Sized + 'static>() -> Self {
        Self {
            type_id: TypeId::of::<H>(),
            type_name: simple_type_name::<H>(),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Simple name of the handler type, for logs.
    pub fn name(&self) -> &'static str {
        self.type_name
    }
}

impl PartialEq for HandlerKey {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for HandlerKey {}

impl Hash for HandlerKey {
    fn hash<S: Hasher>(&self, state: &mut S) {
        self.type_id.hash(state);
    }
}

impl fmt::Debug for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name)
    }
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name)
    }
}

/// The concrete Rust type registered for an event name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventTypeInfo {
    pub name: &'static str,
    pub type_id: TypeId,
}

impl EventTypeInfo {
    pub fn of<E: IntegrationEvent>() -> Self {
        Self {
            name: E::event_name(),
            type_id: TypeId::of::<E>(),
        }
    }
}

// ---------------------------------------------------------------------------
// SubscriptionInfo
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    Typed,
    Dynamic,
}

/// Why a single handler could not process a message.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The handler scope had no instance for this handler.
    #[error("No handler instance could be resolved for {0}")]
    Unresolved(HandlerKey),

    #[error(transparent)]
    Decode(#[from] CodecError),

    #[error("Handler failed: {0:#}")]
    Handler(anyhow::Error),
}

type Invoker = Arc<
    dyn Fn(Arc<dyn HandlerScope>, Arc<[u8]>) -> BoxFuture<'static, Result<(), DispatchError>>
        + Send
        + Sync,
>;

/// One handler registered against one event name.
///
/// Two descriptors are equal when they have the same kind and handler
/// type; that pair is what makes registration idempotent.
#[derive(Clone)]
pub struct SubscriptionInfo {
    kind: SubscriptionKind,
    handler: HandlerKey,
    event_type: Option<EventTypeInfo>,
    invoker: Invoker,
}

impl SubscriptionInfo {
    /// Handler `H` receiving `E` decoded from the message body.
    pub fn typed<E, H>() -> Self
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let invoker: Invoker = Arc::new(|scope: Arc<dyn HandlerScope>, body: Arc<[u8]>| {
            async move {
                let handler = resolve_handler::<H>(scope.as_ref())
                    .ok_or_else(|| DispatchError::Unresolved(HandlerKey::of::<H>()))?;
                let event = codec::decode::<E>(&body)?;
                handler.handle(event).await.map_err(DispatchError::Handler)
            }
            .boxed()
        });

        Self {
            kind: SubscriptionKind::Typed,
            handler: HandlerKey::of::<H>(),
            event_type: Some(EventTypeInfo::of::<E>()),
            invoker,
        }
    }

    /// Handler `H` receiving the body of `event_name` as raw JSON.
    pub fn dynamic<H>(event_name: &str) -> Self
    where
        H: DynamicIntegrationEventHandler,
    {
        let event_name: Arc<str> = Arc::from(event_name);
        let invoker: Invoker = Arc::new(move |scope: Arc<dyn HandlerScope>, body: Arc<[u8]>| {
            let event_name = Arc::clone(&event_name);
            async move {
                let handler = resolve_handler::<H>(scope.as_ref())
                    .ok_or_else(|| DispatchError::Unresolved(HandlerKey::of::<H>()))?;
                let event_data = codec::decode_dynamic(&event_name, &body)?;
                handler.handle(event_data).await.map_err(DispatchError::Handler)
            }
            .boxed()
        });

        Self {
            kind: SubscriptionKind::Dynamic,
            handler: HandlerKey::of::<H>(),
            event_type: None,
            invoker,
        }
    }

    pub fn kind(&self) -> SubscriptionKind {
        self.kind
    }

    pub fn is_dynamic(&self) -> bool {
        self.kind == SubscriptionKind::Dynamic
    }

    pub fn handler(&self) -> HandlerKey {
        self.handler
    }

    /// Event type decoded for typed subscriptions.
    pub fn event_type(&self) -> Option<EventTypeInfo> {
        self.event_type
    }

    /// Resolve the handler from `scope` and run it on `body`.
    pub fn invoke(
        &self,
        scope: Arc<dyn HandlerScope>,
        body: Arc<[u8]>,
    ) -> BoxFuture<'static, Result<(), DispatchError>> {
        (self.invoker)(scope, body)
    }
}

impl PartialEq for SubscriptionInfo {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.handler == other.handler
    }
}

impl Eq for SubscriptionInfo {}

impl fmt::Debug for SubscriptionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionInfo")
            .field("kind", &self.kind)
            .field("handler", &self.handler)
            .finish()
    }
}

impl fmt::Display for SubscriptionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IsDynamic={}, HandlerType={}",
            self.is_dynamic(),
            self.handler
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use sporty_core::events::UserCreatedEvent;
    use uuid::Uuid;

    use super::*;
    use crate::handler::HandlerContainer;

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl IntegrationEventHandler<UserCreatedEvent> for RecordingHandler {
        async fn handle(&self, event: UserCreatedEvent) -> anyhow::Result<()> {
            self.seen
                .lock()
                .expect("lock")
                .push(event.first_name().to_string());
            Ok(())
        }
    }

    struct RawHandler;

    #[async_trait]
    impl DynamicIntegrationEventHandler for RawHandler {
        async fn handle(&self, event_data: serde_json::Value) -> anyhow::Result<()> {
            anyhow::ensure!(event_data.is_object(), "expected an object");
            Ok(())
        }
    }

    fn body_for(event: &UserCreatedEvent) -> Arc<[u8]> {
        Arc::from(serde_json::to_vec(event).expect("serialize"))
    }

    #[tokio::test]
    async fn typed_invoker_decodes_and_calls_handler() {
        let handler = Arc::new(RecordingHandler::default());
        let mut container = HandlerContainer::new();
        container.register_instance(Arc::clone(&handler));
        let scope: Arc<dyn HandlerScope> = Arc::new(container);

        let info = SubscriptionInfo::typed::<UserCreatedEvent, RecordingHandler>();
        let event = UserCreatedEvent::new(Uuid::new_v4(), "Ann", "Lee");
        info.invoke(scope, body_for(&event))
            .await
            .expect("dispatch should succeed");

        assert_eq!(*handler.seen.lock().expect("lock"), vec!["Ann".to_string()]);
        assert_eq!(info.event_type().map(|t| t.name), Some("UserCreatedEvent"));
    }

    #[tokio::test]
    async fn unresolved_handler_is_reported() {
        let scope: Arc<dyn HandlerScope> = Arc::new(HandlerContainer::new());
        let info = SubscriptionInfo::dynamic::<RawHandler>("UserCreatedEvent");

        let result = info.invoke(scope, Arc::from(b"{}".to_vec())).await;
        assert_matches!(result, Err(DispatchError::Unresolved(key)) if key.name() == "RawHandler");
    }

    #[tokio::test]
    async fn dynamic_invoker_rejects_invalid_json() {
        let mut container = HandlerContainer::new();
        container.register(|| RawHandler);
        let scope: Arc<dyn HandlerScope> = Arc::new(container);

        let info = SubscriptionInfo::dynamic::<RawHandler>("UserCreatedEvent");
        let result = info.invoke(scope, Arc::from(b"nope".to_vec())).await;
        assert_matches!(result, Err(DispatchError::Decode(_)));
    }

    #[test]
    fn equality_ignores_invoker_but_not_kind() {
        let typed = SubscriptionInfo::typed::<UserCreatedEvent, RecordingHandler>();
        let again = SubscriptionInfo::typed::<UserCreatedEvent, RecordingHandler>();
        let dynamic = SubscriptionInfo::dynamic::<RawHandler>("UserCreatedEvent");

        assert_eq!(typed, again);
        assert_ne!(typed, dynamic);
        assert_eq!(
            dynamic.to_string(),
            "IsDynamic=true, HandlerType=RawHandler"
        );
    }
}
