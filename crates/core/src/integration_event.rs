//! The integration-event contract.
//!
//! An integration event is a fact that happened in one service and is
//! relevant to others. Every event carries an [`IntegrationEventHeader`]
//! (unique id + creation timestamp) next to its own payload fields, and
//! is routed by its logical name, which defaults to the simple name of
//! the implementing type.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// IntegrationEventHeader
// ---------------------------------------------------------------------------

/// Identity shared by every integration event.
///
/// Embed it with `#[serde(flatten)]` so that `id` and `creationDate`
/// appear at the top level of the wire document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationEventHeader {
    id: Uuid,
    creation_date: DateTime<Utc>,
}

impl IntegrationEventHeader {
    /// A fresh header: random v4 id, stamped now.
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            creation_date: Utc::now(),
        }
    }

    /// Rebuild a header from known values.
    pub fn with(id: Uuid, creation_date: DateTime<Utc>) -> Self {
        Self { id, creation_date }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn creation_date(&self) -> DateTime<Utc> {
        self.creation_date
    }
}

impl Default for IntegrationEventHeader {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// IntegrationEvent
// ---------------------------------------------------------------------------

/// A domain event published across service boundaries.
///
/// Implementors are plain serde structs. The event name (used as the
/// broker routing key) is the simple type name unless
/// [`event_name`](IntegrationEvent::event_name) is overridden.
pub trait IntegrationEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The identity header of this event.
    fn header(&self) -> &IntegrationEventHeader;

    /// Unique event id.
    fn id(&self) -> Uuid {
        self.header().id()
    }

    /// When the event was created (UTC).
    fn creation_date(&self) -> DateTime<Utc> {
        self.header().creation_date()
    }

    /// Logical name of the event, used as routing key.
    fn event_name() -> &'static str
    where
        Self: Sized,
    {
        simple_type_name::<Self>()
    }
}

/// The last path segment of a type's name, without generic arguments.
///
/// `sporty_core::events::user::UserCreatedEvent` becomes
/// `UserCreatedEvent`.
pub fn simple_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    struct SampleHappened {
        #[serde(flatten)]
        header: IntegrationEventHeader,
        value: u32,
    }

    impl IntegrationEvent for SampleHappened {
        fn header(&self) -> &IntegrationEventHeader {
            &self.header
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Renamed {
        #[serde(flatten)]
        header: IntegrationEventHeader,
    }

    impl IntegrationEvent for Renamed {
        fn header(&self) -> &IntegrationEventHeader {
            &self.header
        }

        fn event_name() -> &'static str {
            "custom.renamed"
        }
    }

    #[test]
    fn event_name_defaults_to_simple_type_name() {
        assert_eq!(SampleHappened::event_name(), "SampleHappened");
    }

    #[test]
    fn event_name_can_be_overridden() {
        assert_eq!(Renamed::event_name(), "custom.renamed");
    }

    #[test]
    fn simple_type_name_strips_generics() {
        assert_eq!(simple_type_name::<Vec<String>>(), "Vec");
        assert_eq!(simple_type_name::<u32>(), "u32");
    }

    #[test]
    fn fresh_headers_are_unique() {
        let a = IntegrationEventHeader::new();
        let b = IntegrationEventHeader::new();
        assert_ne!(a.id(), b.id());
        assert!(a.creation_date() <= b.creation_date());
    }

    #[test]
    fn header_is_flattened_in_camel_case() {
        let event = SampleHappened {
            header: IntegrationEventHeader::new(),
            value: 3,
        };
        let json = serde_json::to_value(&event).expect("serialization should succeed");

        assert_eq!(json["id"], event.id().to_string());
        assert!(json["creationDate"].is_string());
        assert_eq!(json["value"], 3);
        assert!(json.get("header").is_none());
    }
}
