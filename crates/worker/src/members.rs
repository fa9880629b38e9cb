//! Group members, kept in memory.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sporty_core::CoreError;
use tokio::sync::RwLock;
use uuid::Uuid;

const ENTITY: &str = "member";

/// A user as seen by the Groups service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub identifier: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub created_on: Option<DateTime<Utc>>,
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Identifier={}, FirstName={}, LastName={}",
            self.identifier, self.first_name, self.last_name
        )
    }
}

/// Member storage keyed by user identifier.
#[derive(Debug, Default)]
pub struct MemberStore {
    members: RwLock<HashMap<Uuid, Member>>,
}

impl MemberStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `member`, stamping its creation time.
    ///
    /// Fails with [`CoreError::Conflict`] if the identifier is taken.
    pub async fn create(&self, mut member: Member) -> Result<Uuid, CoreError> {
        let mut members = self.members.write().await;
        if members.contains_key(&member.identifier) {
            return Err(CoreError::Conflict {
                entity: ENTITY,
                id: member.identifier,
            });
        }

        let id = member.identifier;
        member.created_on = Some(Utc::now());
        members.insert(id, member);
        Ok(id)
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Member, CoreError> {
        self.members
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(CoreError::NotFound { entity: ENTITY, id })
    }

    /// Every member, oldest first.
    pub async fn get_all(&self) -> Vec<Member> {
        let mut all: Vec<Member> = self.members.read().await.values().cloned().collect();
        all.sort_by_key(|m| m.created_on);
        all
    }

    /// Returns `true` if a member was removed.
    pub async fn delete(&self, id: Uuid) -> bool {
        self.members.write().await.remove(&id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.members.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn member(first: &str, last: &str) -> Member {
        Member {
            identifier: Uuid::new_v4(),
            first_name: first.into(),
            last_name: last.into(),
            created_on: None,
        }
    }

    #[tokio::test]
    async fn create_stamps_and_stores_member() {
        let store = MemberStore::new();
        let ann = member("Ann", "Lee");

        let id = store.create(ann.clone()).await.expect("create should succeed");
        let stored = store.get_by_id(id).await.expect("member should exist");

        assert_eq!(stored.first_name, "Ann");
        assert!(stored.created_on.is_some());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn duplicate_identifier_conflicts() {
        let store = MemberStore::new();
        let ann = member("Ann", "Lee");
        store.create(ann.clone()).await.expect("first create");

        let err = store.create(ann.clone()).await.unwrap_err();
        assert_matches!(err, CoreError::Conflict { entity: "member", id } if id == ann.identifier);
    }

    #[tokio::test]
    async fn missing_member_is_not_found() {
        let store = MemberStore::new();
        let id = Uuid::new_v4();

        assert_matches!(store.get_by_id(id).await, Err(CoreError::NotFound { .. }));
        assert!(!store.delete(id).await);
    }

    #[tokio::test]
    async fn delete_removes_member() {
        let store = MemberStore::new();
        let id = store.create(member("Bo", "Ng")).await.expect("create");

        assert!(store.delete(id).await);
        assert!(store.is_empty().await);
    }
}
