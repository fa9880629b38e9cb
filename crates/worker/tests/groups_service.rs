//! Integration tests for the Groups service wiring.
//!
//! Runs the real handlers behind an [`EventBus`] on the in-memory broker
//! and publishes from a second bus, as the Users service would.

use std::sync::Arc;
use std::time::Duration;

use sporty_core::events::UserCreatedEvent;
use sporty_events::{EventBus, EventBusConfig, HandlerContainer, InMemoryBroker};
use sporty_worker::members::MemberStore;
use sporty_worker::service;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

fn config(service_name: &str) -> EventBusConfig {
    EventBusConfig::from_lookup(|key| match key {
        "SERVICE_NAME" => Some(service_name.to_string()),
        "EVENT_BUS_RETRY_COUNT" => Some("2".into()),
        "EVENT_BUS_RETRY_DELAY_MS" => Some("1".into()),
        "EVENT_BUS_RETRY_MAX_DELAY_MS" => Some("5".into()),
        _ => None,
    })
    .expect("test config should load")
}

async fn wait_for_members(members: &MemberStore, count: usize) {
    tokio::time::timeout(WAIT, async {
        while members.len().await < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("members were not created in time");
}

// ---------------------------------------------------------------------------
// Test: UserCreatedEvent creates a member
// ---------------------------------------------------------------------------

/// A user published by the Users service shows up as a group member.
#[tokio::test]
async fn published_user_becomes_group_member() {
    let broker = InMemoryBroker::new();
    let members = Arc::new(MemberStore::new());
    let groups = service::start_groups_service(
        Arc::new(broker.clone()),
        &config("groups"),
        Arc::clone(&members),
    )
    .await
    .expect("groups service should start");
    let users = EventBus::from_config(
        Arc::new(broker.clone()),
        Arc::new(HandlerContainer::new()),
        &config("users"),
    );

    let identifier = Uuid::new_v4();
    users
        .publish(&UserCreatedEvent::new(identifier, "Ann", "Lee"))
        .await
        .expect("publish should succeed");

    wait_for_members(&members, 1).await;
    let member = members.get_by_id(identifier).await.expect("member stored");
    assert_eq!(member.first_name, "Ann");
    assert_eq!(member.last_name, "Lee");

    groups.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: subscriptions and topology
// ---------------------------------------------------------------------------

/// Both handlers share the single `UserCreatedEvent` binding.
#[tokio::test]
async fn groups_queue_is_bound_once_for_user_created() {
    let broker = InMemoryBroker::new();
    let groups = service::start_groups_service(
        Arc::new(broker.clone()),
        &config("groups"),
        Arc::new(MemberStore::new()),
    )
    .await
    .expect("groups service should start");

    assert_eq!(broker.bindings("groups"), vec!["UserCreatedEvent".to_string()]);
    assert_eq!(groups.handlers_for_event("UserCreatedEvent").await.len(), 2);

    groups.shutdown().await;
}

// ---------------------------------------------------------------------------
// Test: backlog
// ---------------------------------------------------------------------------

/// Users created while the Groups service was down are picked up when it
/// comes back, because the queue is durable.
#[tokio::test]
async fn backlog_is_consumed_after_restart() {
    let broker = InMemoryBroker::new();
    let first = service::start_groups_service(
        Arc::new(broker.clone()),
        &config("groups"),
        Arc::new(MemberStore::new()),
    )
    .await
    .expect("groups service should start");
    first.shutdown().await;

    let users = EventBus::from_config(
        Arc::new(broker.clone()),
        Arc::new(HandlerContainer::new()),
        &config("users"),
    );
    for name in ["Ann", "Bo", "Cy"] {
        users
            .publish(&UserCreatedEvent::new(Uuid::new_v4(), name, "Lee"))
            .await
            .expect("publish should succeed");
    }
    assert_eq!(broker.queue_depth("groups"), 3);

    let members = Arc::new(MemberStore::new());
    let second = service::start_groups_service(
        Arc::new(broker.clone()),
        &config("groups"),
        Arc::clone(&members),
    )
    .await
    .expect("groups service should restart");

    wait_for_members(&members, 3).await;
    second.shutdown().await;
}
