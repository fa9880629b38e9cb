//! Wire boundary between events and broker messages.
//!
//! A message body is the event serialized as a JSON document; the routing
//! key is the event's logical name ([`IntegrationEvent::event_name`]).

use sporty_core::IntegrationEvent;

use crate::broker::{DeliveryMode, PublishProperties};

/// MIME type stamped on every published body.
pub const CONTENT_TYPE: &str = "application/json";

/// An event ready to hand to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedEvent {
    pub routing_key: &'static str,
    pub properties: PublishProperties,
    pub body: Vec<u8>,
}

/// Serialize `event` into a persistent, mandatory JSON message.
pub fn encode<E: IntegrationEvent>(event: &E) -> Result<EncodedEvent, CodecError> {
    let routing_key = E::event_name();
    let body = serde_json::to_vec(event).map_err(|source| CodecError::Serialize {
        event_name: routing_key.to_string(),
        source,
    })?;

    Ok(EncodedEvent {
        routing_key,
        properties: PublishProperties {
            delivery_mode: DeliveryMode::Persistent,
            content_type: Some(CONTENT_TYPE.to_string()),
            message_id: Some(event.id().to_string()),
            mandatory: true,
        },
        body,
    })
}

/// Deserialize a message body into the concrete event type.
pub fn decode<E: IntegrationEvent>(body: &[u8]) -> Result<E, CodecError> {
    serde_json::from_slice(body).map_err(|source| CodecError::Deserialize {
        event_name: E::event_name().to_string(),
        source,
    })
}

/// Parse a message body as an untyped JSON document.
pub fn decode_dynamic(event_name: &str, body: &[u8]) -> Result<serde_json::Value, CodecError> {
    serde_json::from_slice(body).map_err(|source| CodecError::Deserialize {
        event_name: event_name.to_string(),
        source,
    })
}

/// Errors converting between events and message bodies.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Failed to serialize {event_name}: {source}")]
    Serialize {
        event_name: String,
        source: serde_json::Error,
    },

    #[error("Failed to deserialize {event_name}: {source}")]
    Deserialize {
        event_name: String,
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use sporty_core::events::UserCreatedEvent;
    use uuid::Uuid;

    use super::*;

    #[test]
    fn encode_uses_event_name_and_persistent_delivery() {
        let event = UserCreatedEvent::new(Uuid::new_v4(), "Ann", "Lee");
        let encoded = encode(&event).expect("encode should succeed");

        assert_eq!(encoded.routing_key, "UserCreatedEvent");
        assert_eq!(encoded.properties.delivery_mode, DeliveryMode::Persistent);
        assert!(encoded.properties.mandatory);
        assert_eq!(encoded.properties.message_id, Some(event.id().to_string()));
        assert_eq!(encoded.properties.content_type.as_deref(), Some(CONTENT_TYPE));
    }

    #[test]
    fn decode_restores_typed_event() {
        let event = UserCreatedEvent::new(Uuid::new_v4(), "Ann", "Lee");
        let encoded = encode(&event).expect("encode should succeed");

        let decoded: UserCreatedEvent = decode(&encoded.body).expect("decode should succeed");
        assert_eq!(decoded, event);
    }

    #[test]
    fn decode_dynamic_exposes_raw_fields() {
        let event = UserCreatedEvent::new(Uuid::new_v4(), "Ann", "Lee");
        let encoded = encode(&event).expect("encode should succeed");

        let value = decode_dynamic("UserCreatedEvent", &encoded.body).expect("parse");
        assert_eq!(value["firstName"], "Ann");
        assert_eq!(value["id"], event.id().to_string());
    }

    #[test]
    fn malformed_body_reports_event_name() {
        let err = decode::<UserCreatedEvent>(b"{not json").unwrap_err();
        assert_matches!(
            &err,
            CodecError::Deserialize { event_name, .. } if event_name == "UserCreatedEvent"
        );
        assert!(err.to_string().starts_with("Failed to deserialize UserCreatedEvent"));
    }
}
