//! Integration event handlers of the Groups service.

use std::sync::Arc;

use async_trait::async_trait;
use sporty_core::events::UserCreatedEvent;
use sporty_core::{CoreError, IntegrationEvent};
use sporty_events::{DynamicIntegrationEventHandler, IntegrationEventHandler};

use crate::members::{Member, MemberStore};

impl From<&UserCreatedEvent> for Member {
    fn from(event: &UserCreatedEvent) -> Self {
        Self {
            identifier: event.identifier(),
            first_name: event.first_name().to_string(),
            last_name: event.last_name().to_string(),
            created_on: None,
        }
    }
}

/// Turns every new user into a group member.
pub struct UserCreatedEventHandler {
    members: Arc<MemberStore>,
}

impl UserCreatedEventHandler {
    pub fn new(members: Arc<MemberStore>) -> Self {
        Self { members }
    }
}

#[async_trait]
impl IntegrationEventHandler<UserCreatedEvent> for UserCreatedEventHandler {
    async fn handle(&self, event: UserCreatedEvent) -> anyhow::Result<()> {
        tracing::info!(event_id = %event.id(), "Handling event {event}");

        match self.members.create(Member::from(&event)).await {
            Ok(id) => {
                tracing::debug!(member_id = %id, "Created member");
                Ok(())
            }
            // Redelivered message: the member is already there.
            Err(CoreError::Conflict { id, .. }) => {
                tracing::info!(member_id = %id, "Member already exists, skipping");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Logs every event it is subscribed to, as raw JSON.
#[derive(Debug, Default)]
pub struct AuditLogHandler;

#[async_trait]
impl DynamicIntegrationEventHandler for AuditLogHandler {
    async fn handle(&self, event_data: serde_json::Value) -> anyhow::Result<()> {
        let Some(event_id) = event_data.get("id").and_then(|v| v.as_str()) else {
            anyhow::bail!("event has no id: {event_data}");
        };

        tracing::info!(event_id, "Audit: {event_data}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[tokio::test]
    async fn user_created_event_becomes_member() {
        let members = Arc::new(MemberStore::new());
        let handler = UserCreatedEventHandler::new(Arc::clone(&members));
        let identifier = Uuid::new_v4();

        handler
            .handle(UserCreatedEvent::new(identifier, "Ann", "Lee"))
            .await
            .expect("handler should succeed");

        let member = members.get_by_id(identifier).await.expect("member stored");
        assert_eq!(member.first_name, "Ann");
        assert_eq!(member.last_name, "Lee");
    }

    #[tokio::test]
    async fn redelivered_event_is_idempotent() {
        let members = Arc::new(MemberStore::new());
        let handler = UserCreatedEventHandler::new(Arc::clone(&members));
        let event = UserCreatedEvent::new(Uuid::new_v4(), "Ann", "Lee");

        handler.handle(event.clone()).await.expect("first delivery");
        handler.handle(event).await.expect("redelivery");

        assert_eq!(members.len().await, 1);
    }

    #[tokio::test]
    async fn audit_rejects_documents_without_id() {
        let handler = AuditLogHandler;

        assert!(handler
            .handle(serde_json::json!({ "id": "abc", "firstName": "Ann" }))
            .await
            .is_ok());
        assert!(handler
            .handle(serde_json::json!({ "firstName": "Ann" }))
            .await
            .is_err());
    }
}
