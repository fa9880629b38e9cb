//! Sporty shared core types.
//!
//! Holds the [`IntegrationEvent`] contract every cross-service event
//! implements, and the event DTOs shared between services (see
//! [`events`]).

pub mod error;
pub mod events;
pub mod integration_event;

pub use error::CoreError;
pub use integration_event::{simple_type_name, IntegrationEvent, IntegrationEventHeader};
