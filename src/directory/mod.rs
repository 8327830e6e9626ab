//! Lookups the real-time layer needs from the rest of the backend.
//!
//! The relay never owns user or conversation records. It asks a directory to
//! resolve the user behind a handshake token, to confirm conversation
//! participants before a room join, and (for the inactivity job) to list and
//! mark inactive users.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::MemoryDirectory;
#[cfg(feature = "postgres")]
pub use postgres::PgDirectory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::UserId;

/// Public identity fields attached to relayed messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: UserId,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub avatar: Option<String>,
}

/// Full user record as kept by a directory backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryUser {
    #[serde(flatten)]
    pub profile: UserProfile,
    pub email: String,
    #[serde(default)]
    pub is_admin: bool,
    pub last_active: DateTime<Utc>,
    #[serde(default)]
    pub last_notification_sent: Option<DateTime<Utc>>,
}

/// A user selected by the inactivity scan.
#[derive(Debug, Clone, PartialEq)]
pub struct InactiveUser {
    pub id: UserId,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub last_active: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("failed to read directory seed: {0}")]
    SeedIo(#[from] std::io::Error),
    #[error("invalid directory seed: {0}")]
    SeedFormat(#[from] serde_json::Error),
    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_user(&self, user_id: &str) -> Result<Option<UserProfile>, DirectoryError>;
}

#[async_trait]
pub trait ConversationDirectory: Send + Sync {
    async fn is_participant(&self, conversation_id: &str, user_id: &str) -> Result<bool, DirectoryError>;
}

#[async_trait]
pub trait InactiveUserStore: Send + Sync {
    /// Non-admin users last active before `inactive_before` whose last notice is absent
    /// or older than `notified_before`.
    async fn find_inactive(
        &self,
        inactive_before: DateTime<Utc>,
        notified_before: DateTime<Utc>,
    ) -> Result<Vec<InactiveUser>, DirectoryError>;

    async fn mark_notified(&self, user_ids: &[UserId], at: DateTime<Utc>) -> Result<(), DirectoryError>;
}

/// Everything the server needs from one backend.
pub trait Directory: UserDirectory + ConversationDirectory + InactiveUserStore {}

impl<T> Directory for T where T: UserDirectory + ConversationDirectory + InactiveUserStore {}
