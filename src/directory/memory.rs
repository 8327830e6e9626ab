use std::collections::{HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;

use super::{
    ConversationDirectory, DirectoryError, DirectoryUser, InactiveUser, InactiveUserStore, UserDirectory,
    UserProfile,
};
use crate::{RoomId, UserId};

#[derive(Debug, Deserialize)]
struct Seed {
    #[serde(default)]
    users: Vec<DirectoryUser>,
    #[serde(default)]
    conversations: Vec<SeedConversation>,
}

#[derive(Debug, Deserialize)]
struct SeedConversation {
    id: RoomId,
    participants: Vec<UserId>,
}

/// In-process directory, used for tests and single-node deployments without a database.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    users: RwLock<HashMap<UserId, DirectoryUser>>,
    conversations: RwLock<HashMap<RoomId, HashSet<UserId>>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads users and conversations from a JSON file of the form
    /// `{"users": [...], "conversations": [{"id": "...", "participants": [...]}]}`.
    pub async fn from_seed_file(path: impl AsRef<Path>) -> Result<Self, DirectoryError> {
        let raw = tokio::fs::read_to_string(path).await?;
        let seed: Seed = serde_json::from_str(&raw)?;

        let dir = Self::new();
        for user in seed.users {
            dir.insert_user(user).await;
        }
        for conv in seed.conversations {
            dir.insert_conversation(conv.id, conv.participants).await;
        }
        Ok(dir)
    }

    pub async fn insert_user(&self, user: DirectoryUser) {
        self.users.write().await.insert(user.profile.id.clone(), user);
    }

    pub async fn insert_conversation(&self, conversation_id: RoomId, participants: impl IntoIterator<Item = UserId>) {
        self.conversations
            .write()
            .await
            .entry(conversation_id)
            .or_insert_with(HashSet::new)
            .extend(participants);
    }

    pub async fn user(&self, user_id: &str) -> Option<DirectoryUser> {
        self.users.read().await.get(user_id).cloned()
    }
}

#[async_trait]
impl UserDirectory for MemoryDirectory {
    async fn find_user(&self, user_id: &str) -> Result<Option<UserProfile>, DirectoryError> {
        Ok(self.users.read().await.get(user_id).map(|u| u.profile.clone()))
    }
}

#[async_trait]
impl ConversationDirectory for MemoryDirectory {
    async fn is_participant(&self, conversation_id: &str, user_id: &str) -> Result<bool, DirectoryError> {
        Ok(self
            .conversations
            .read()
            .await
            .get(conversation_id)
            .map_or(false, |participants| participants.contains(user_id)))
    }
}

#[async_trait]
impl InactiveUserStore for MemoryDirectory {
    async fn find_inactive(
        &self,
        inactive_before: DateTime<Utc>,
        notified_before: DateTime<Utc>,
    ) -> Result<Vec<InactiveUser>, DirectoryError> {
        let users = self.users.read().await;
        let mut out: Vec<InactiveUser> = users
            .values()
            .filter(|u| !u.is_admin && u.last_active < inactive_before)
            .filter(|u| u.last_notification_sent.map_or(true, |sent| sent < notified_before))
            .map(|u| InactiveUser {
                id: u.profile.id.clone(),
                email: u.email.clone(),
                first_name: u.profile.first_name.clone(),
                last_name: u.profile.last_name.clone(),
                last_active: u.last_active,
            })
            .collect();
        // Stable order so batches are deterministic.
        out.sort_by(|a, b| a.last_active.cmp(&b.last_active).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn mark_notified(&self, user_ids: &[UserId], at: DateTime<Utc>) -> Result<(), DirectoryError> {
        let mut users = self.users.write().await;
        for id in user_ids {
            if let Some(u) = users.get_mut(id) {
                u.last_notification_sent = Some(at);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn user(id: &str, last_active: DateTime<Utc>) -> DirectoryUser {
        DirectoryUser {
            profile: UserProfile {
                id: id.into(),
                first_name: id.to_uppercase(),
                last_name: "Test".into(),
                avatar: None,
            },
            email: format!("{id}@example.com"),
            is_admin: false,
            last_active,
            last_notification_sent: None,
        }
    }

    #[tokio::test]
    async fn participant_lookup() {
        let dir = MemoryDirectory::new();
        dir.insert_conversation("conv-1".into(), vec!["a".to_string(), "b".to_string()]).await;

        assert!(dir.is_participant("conv-1", "a").await.unwrap());
        assert!(!dir.is_participant("conv-1", "c").await.unwrap());
        assert!(!dir.is_participant("conv-2", "a").await.unwrap());
    }

    #[tokio::test]
    async fn inactive_filter_skips_admins_and_recent_notices() {
        let now = Utc::now();
        let dir = MemoryDirectory::new();
        dir.insert_user(user("stale", now - Duration::days(30))).await;
        dir.insert_user(user("fresh", now - Duration::days(1))).await;

        let mut admin = user("admin", now - Duration::days(30));
        admin.is_admin = true;
        dir.insert_user(admin).await;

        let mut nudged = user("nudged", now - Duration::days(30));
        nudged.last_notification_sent = Some(now - Duration::days(2));
        dir.insert_user(nudged).await;

        let found = dir
            .find_inactive(now - Duration::days(14), now - Duration::days(7))
            .await
            .unwrap();
        let ids: Vec<_> = found.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["stale"]);

        dir.mark_notified(&["stale".to_string()], now).await.unwrap();
        assert_eq!(dir.user("stale").await.unwrap().last_notification_sent, Some(now));
    }

    #[tokio::test]
    async fn loads_seed_file() {
        let path = std::env::temp_dir().join(format!("convo-relay-seed-{}.json", uuid::Uuid::new_v4()));
        let seed = r#"{
            "users": [{"id": "u1", "firstName": "Ann", "lastName": "Lee", "email": "ann@example.com",
                       "lastActive": "2024-01-01T00:00:00Z"}],
            "conversations": [{"id": "conv-9", "participants": ["u1"]}]
        }"#;
        tokio::fs::write(&path, seed).await.unwrap();

        let dir = MemoryDirectory::from_seed_file(&path).await.unwrap();
        let _ = tokio::fs::remove_file(&path).await;

        let profile = dir.find_user("u1").await.unwrap().unwrap();
        assert_eq!(profile.first_name, "Ann");
        assert_eq!(profile.avatar, None);
        assert!(dir.is_participant("conv-9", "u1").await.unwrap());
    }
}
