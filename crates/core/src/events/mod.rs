//! Integration events shared between services.

pub mod user;

pub use user::UserCreatedEvent;
