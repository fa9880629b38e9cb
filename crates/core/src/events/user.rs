//! Events published by the Users service.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::integration_event::{IntegrationEvent, IntegrationEventHeader};

/// Published after a user has been stored by the Users service.
///
/// Wire form (routing key `UserCreatedEvent`):
///
/// ```json
/// { "id": "…", "creationDate": "…", "identifier": "…",
///   "firstName": "Ann", "lastName": "Lee" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCreatedEvent {
    #[serde(flatten)]
    header: IntegrationEventHeader,
    identifier: Uuid,
    first_name: String,
    last_name: String,
}

impl UserCreatedEvent {
    pub fn new(identifier: Uuid, first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        Self {
            header: IntegrationEventHeader::new(),
            identifier,
            first_name: first_name.into(),
            last_name: last_name.into(),
        }
    }

    /// Id of the user that was created.
    pub fn identifier(&self) -> Uuid {
        self.identifier
    }

    pub fn first_name(&self) -> &str {
        &self.first_name
    }

    pub fn last_name(&self) -> &str {
        &self.last_name
    }
}

impl IntegrationEvent for UserCreatedEvent {
    fn header(&self) -> &IntegrationEventHeader {
        &self.header
    }
}

impl fmt::Display for UserCreatedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Identifier={}, Name={} {}",
            self.identifier, self.first_name, self.last_name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_key_is_type_name() {
        assert_eq!(UserCreatedEvent::event_name(), "UserCreatedEvent");
    }

    #[test]
    fn wire_document_uses_camel_case_fields() {
        let identifier = Uuid::new_v4();
        let event = UserCreatedEvent::new(identifier, "Ann", "Lee");

        let json = serde_json::to_value(&event).expect("serialization should succeed");
        assert_eq!(json["identifier"], identifier.to_string());
        assert_eq!(json["firstName"], "Ann");
        assert_eq!(json["lastName"], "Lee");
        assert_eq!(json["id"], event.id().to_string());
    }

    #[test]
    fn parses_document_from_another_service() {
        let raw = r#"{
            "id": "6f2b8b5e-3d52-4b5e-9a43-0c7c1f0f4a11",
            "creationDate": "2024-03-01T10:00:00Z",
            "identifier": "0b9d7a34-1f7e-4c1e-8f57-5d1f2b8e9c20",
            "firstName": "Ann",
            "lastName": "Lee"
        }"#;

        let event: UserCreatedEvent = serde_json::from_str(raw).expect("should parse");
        assert_eq!(event.first_name(), "Ann");
        assert_eq!(event.last_name(), "Lee");
        assert_eq!(
            event.id().to_string(),
            "6f2b8b5e-3d52-4b5e-9a43-0c7c1f0f4a11"
        );
        assert_eq!(event.creation_date().to_rfc3339(), "2024-03-01T10:00:00+00:00");
    }

    #[test]
    fn display_shows_identifier_and_full_name() {
        let identifier = Uuid::nil();
        let event = UserCreatedEvent::new(identifier, "Ann", "Lee");
        assert_eq!(
            event.to_string(),
            format!("Identifier={identifier}, Name=Ann Lee")
        );
    }
}
