//! `sporty-worker` library crate.
//!
//! The Groups service side of the event bus: member storage, the handlers
//! it subscribes, and [`service::start_groups_service`] which wires them
//! to an [`EventBus`](sporty_events::EventBus). The binary entrypoint
//! lives in `main.rs`.

pub mod handlers;
pub mod members;
pub mod service;
